mod ddl;
mod delete_slot;
mod init;
mod listen;

pub use ddl::cmd_ddl;
pub use delete_slot::cmd_delete_slot;
pub use init::cmd_init;
pub use listen::cmd_listen;
