//! Per-table replica identity and its DDL.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::ident::{Identifier, TableName};

/// How much of the old row image Postgres writes to WAL for UPDATE and DELETE.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ReplicaIdentity {
    /// Primary key columns only.
    #[default]
    Default,
    /// Every column of the old row.
    Full,
    /// No old row information.
    Nothing,
    /// Columns of the given unique index.
    UsingIndex(Identifier),
}

impl ReplicaIdentity {
    /// Replica identity backed by a unique index. Fails if `index` is not a legal identifier.
    pub fn using_index(index: &str) -> Result<Self> {
        Ok(Self::UsingIndex(Identifier::parse(index)?))
    }

    /// The `ALTER TABLE` statement applying this identity to `table`.
    pub fn ddl(&self, table: &TableName) -> String {
        format!("ALTER TABLE {} REPLICA IDENTITY {};", table.quoted(), self)
    }
}

impl fmt::Display for ReplicaIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicaIdentity::Default => f.write_str("DEFAULT"),
            ReplicaIdentity::Full => f.write_str("FULL"),
            ReplicaIdentity::Nothing => f.write_str("NOTHING"),
            ReplicaIdentity::UsingIndex(index) => write!(f, "USING INDEX {}", index.quoted()),
        }
    }
}

impl FromStr for ReplicaIdentity {
    type Err = Error;

    /// Accepts `default`, `full`, `nothing` and `using index <name>`, case-insensitively.
    fn from_str(s: &str) -> Result<Self> {
        let words: Vec<&str> = s.split_whitespace().collect();
        match words.as_slice() {
            [mode] if mode.eq_ignore_ascii_case("default") => Ok(Self::Default),
            [mode] if mode.eq_ignore_ascii_case("full") => Ok(Self::Full),
            [mode] if mode.eq_ignore_ascii_case("nothing") => Ok(Self::Nothing),
            [using, index, name]
                if using.eq_ignore_ascii_case("using") && index.eq_ignore_ascii_case("index") =>
            {
                Self::using_index(name)
            }
            _ => Err(Error::InvalidReplicaIdentity(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders() -> TableName {
        TableName::new("public", "orders").unwrap()
    }

    #[test]
    fn test_ddl_for_each_mode() {
        assert_eq!(
            ReplicaIdentity::Default.ddl(&orders()),
            r#"ALTER TABLE "public"."orders" REPLICA IDENTITY DEFAULT;"#
        );
        assert_eq!(
            ReplicaIdentity::Full.ddl(&orders()),
            r#"ALTER TABLE "public"."orders" REPLICA IDENTITY FULL;"#
        );
        assert_eq!(
            ReplicaIdentity::Nothing.ddl(&orders()),
            r#"ALTER TABLE "public"."orders" REPLICA IDENTITY NOTHING;"#
        );
        assert_eq!(
            ReplicaIdentity::using_index("orders_pkey")
                .unwrap()
                .ddl(&orders()),
            r#"ALTER TABLE "public"."orders" REPLICA IDENTITY USING INDEX "orders_pkey";"#
        );
    }

    #[test]
    fn test_ddl_quotes_reserved_and_mixed_case_names() {
        let order = TableName::new("public", "order").unwrap();
        assert_eq!(
            ReplicaIdentity::Full.ddl(&order),
            r#"ALTER TABLE "public"."order" REPLICA IDENTITY FULL;"#
        );

        let mixed: TableName = "Sales.Orders".parse().unwrap();
        assert_eq!(
            ReplicaIdentity::Default.ddl(&mixed),
            r#"ALTER TABLE "Sales"."Orders" REPLICA IDENTITY DEFAULT;"#
        );

        let select = ReplicaIdentity::using_index("select").unwrap();
        assert_eq!(select.to_string(), r#"USING INDEX "select""#);
    }

    #[test]
    fn test_using_index_rejects_bad_names() {
        assert!(ReplicaIdentity::using_index("orders_pkey; DROP TABLE orders").is_err());
        assert!(ReplicaIdentity::using_index("").is_err());
    }

    #[test]
    fn test_parse_replica_identity() {
        assert_eq!("full".parse::<ReplicaIdentity>().unwrap(), ReplicaIdentity::Full);
        assert_eq!("DEFAULT".parse::<ReplicaIdentity>().unwrap(), ReplicaIdentity::Default);
        assert_eq!("nothing".parse::<ReplicaIdentity>().unwrap(), ReplicaIdentity::Nothing);
        assert_eq!(
            "using index orders_pkey".parse::<ReplicaIdentity>().unwrap(),
            ReplicaIdentity::UsingIndex(Identifier::parse("orders_pkey").unwrap())
        );
        assert!("partial".parse::<ReplicaIdentity>().is_err());
        assert!("using index".parse::<ReplicaIdentity>().is_err());
    }
}
