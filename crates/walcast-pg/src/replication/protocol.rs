//! Wire format of the streaming replication sub-protocol.
//!
//! Backend messages are decoded by `postgres_protocol`, except CopyBothResponse which it
//! does not model and which is recognised from the message header here.

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use fallible_iterator::FallibleIterator;
use postgres_protocol::message::backend::{self, ErrorFields};
use postgres_protocol::message::frontend;

use super::lsn::Lsn;
use crate::error::{PgError, PgResult};

/// Seconds between the Unix epoch and the PostgreSQL epoch (2000-01-01).
const PG_EPOCH_OFFSET_SECS: i64 = 946_684_800;

const COPY_BOTH_RESPONSE_TAG: u8 = b'W';

/// A backend message received on a replication connection.
pub enum BackendMessage {
    /// The server switched to CopyBoth mode for `START_REPLICATION`.
    CopyBothResponse,
    Message(backend::Message),
}

/// Split one complete backend message off the front of `buf`, if there is one.
pub fn next_message(buf: &mut BytesMut) -> PgResult<Option<BackendMessage>> {
    if let Some(header) = backend::Header::parse(&buf[..])? {
        if header.tag() == COPY_BOTH_RESPONSE_TAG {
            let total = header.len() as usize + 1;
            if buf.len() < total {
                buf.reserve(total - buf.len());
                return Ok(None);
            }
            buf.advance(total);
            return Ok(Some(BackendMessage::CopyBothResponse));
        }
    }

    Ok(backend::Message::parse(buf)?.map(BackendMessage::Message))
}

/// Payload of a CopyData message on a replication stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationMessage {
    XLogData {
        wal_start: Lsn,
        wal_end: Lsn,
        server_time_micros: i64,
        data: Bytes,
    },
    PrimaryKeepalive {
        wal_end: Lsn,
        server_time_micros: i64,
        reply_requested: bool,
    },
}

impl ReplicationMessage {
    pub fn parse(mut body: Bytes) -> PgResult<Self> {
        if body.is_empty() {
            return Err(PgError::Protocol("empty CopyData payload".into()));
        }

        match body.get_u8() {
            b'w' => {
                if body.remaining() < 24 {
                    return Err(PgError::Protocol(format!(
                        "XLogData too short: {} bytes",
                        body.remaining()
                    )));
                }
                let wal_start = Lsn(body.get_u64());
                let wal_end = Lsn(body.get_u64());
                let server_time_micros = body.get_i64();
                Ok(ReplicationMessage::XLogData {
                    wal_start,
                    wal_end,
                    server_time_micros,
                    data: body,
                })
            }
            b'k' => {
                if body.remaining() < 17 {
                    return Err(PgError::Protocol(format!(
                        "primary keepalive too short: {} bytes",
                        body.remaining()
                    )));
                }
                Ok(ReplicationMessage::PrimaryKeepalive {
                    wal_end: Lsn(body.get_u64()),
                    server_time_micros: body.get_i64(),
                    reply_requested: body.get_u8() != 0,
                })
            }
            kind => Err(PgError::Protocol(format!(
                "unknown CopyData kind 0x{:02x}",
                kind
            ))),
        }
    }
}

/// Progress reported to the server in a standby status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StandbyStatus {
    pub received: Lsn,
    pub flushed: Lsn,
    pub applied: Lsn,
}

/// Encode a standby status update (`r`) wrapped in CopyData.
pub fn standby_status_update(
    status: StandbyStatus,
    client_time_micros: i64,
    reply_requested: bool,
    buf: &mut BytesMut,
) -> PgResult<()> {
    let mut payload = BytesMut::with_capacity(34);
    payload.extend_from_slice(b"r");
    payload.extend_from_slice(&status.received.0.to_be_bytes());
    payload.extend_from_slice(&status.flushed.0.to_be_bytes());
    payload.extend_from_slice(&status.applied.0.to_be_bytes());
    payload.extend_from_slice(&client_time_micros.to_be_bytes());
    payload.extend_from_slice(&[u8::from(reply_requested)]);

    frontend::CopyData::new(payload.freeze())?.write(buf);
    Ok(())
}

/// Current time in microseconds since the PostgreSQL epoch.
pub fn pg_now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros() - PG_EPOCH_OFFSET_SECS * 1_000_000
}

/// Turn the fields of an ErrorResponse or NoticeResponse into a [`PgError::Db`].
pub fn db_error(fields: ErrorFields<'_>) -> PgError {
    parse_db_error(fields)
        .unwrap_or_else(|e| PgError::Protocol(format!("malformed error response: {}", e)))
}

fn parse_db_error(mut fields: ErrorFields<'_>) -> io::Result<PgError> {
    let mut severity = None;
    let mut code = String::new();
    let mut message = String::new();

    while let Some(field) = fields.next()? {
        let value = String::from_utf8_lossy(field.value_bytes()).into_owned();
        match field.type_() {
            // V is the non-localized severity, preferred over S
            b'V' => severity = Some(value),
            b'S' if severity.is_none() => severity = Some(value),
            b'C' => code = value,
            b'M' => message = value,
            _ => {}
        }
    }

    Ok(PgError::Db {
        severity: severity.unwrap_or_else(|| "ERROR".to_string()),
        code,
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use postgres_protocol::message::backend::Message;

    fn frame(tag: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        out.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    fn copy_data(buf: &mut BytesMut) -> Bytes {
        match next_message(buf).unwrap() {
            Some(BackendMessage::Message(Message::CopyData(body))) => body.into_bytes(),
            _ => panic!("expected CopyData"),
        }
    }

    #[test]
    fn test_next_message_waits_for_complete_frame() {
        let bytes = frame(b'd', b"hello");
        let mut buf = BytesMut::from(&bytes[..6]);
        assert!(next_message(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 6);

        buf.extend_from_slice(&bytes[6..]);
        buf.extend_from_slice(&frame(b'Z', b"I"));

        assert_eq!(&copy_data(&mut buf)[..], b"hello");
        assert!(matches!(
            next_message(&mut buf).unwrap(),
            Some(BackendMessage::Message(Message::ReadyForQuery(_)))
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_next_message_copy_both_response() {
        // text format, no columns
        let bytes = frame(b'W', &[0, 0, 0]);
        let mut buf = BytesMut::from(&bytes[..4]);
        assert!(next_message(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 4);

        buf.extend_from_slice(&bytes[4..]);
        buf.extend_from_slice(&frame(b'd', b"k"));
        assert!(matches!(
            next_message(&mut buf).unwrap(),
            Some(BackendMessage::CopyBothResponse)
        ));
        assert_eq!(&copy_data(&mut buf)[..], b"k");
    }

    #[test]
    fn test_next_message_rejects_bad_length() {
        let mut buf = BytesMut::from(&[b'd', 0, 0, 0, 2][..]);
        assert!(next_message(&mut buf).is_err());

        let mut buf = BytesMut::from(&[b'W', 0, 0, 0, 1][..]);
        assert!(next_message(&mut buf).is_err());
    }

    #[test]
    fn test_parse_xlogdata() {
        let mut body = vec![b'w'];
        body.extend_from_slice(&0x10u64.to_be_bytes());
        body.extend_from_slice(&0x20u64.to_be_bytes());
        body.extend_from_slice(&7i64.to_be_bytes());
        body.extend_from_slice(br#"{"action":"I"}"#);

        match ReplicationMessage::parse(Bytes::from(body)).unwrap() {
            ReplicationMessage::XLogData {
                wal_start,
                wal_end,
                server_time_micros,
                data,
            } => {
                assert_eq!(wal_start, Lsn(0x10));
                assert_eq!(wal_end, Lsn(0x20));
                assert_eq!(server_time_micros, 7);
                assert_eq!(&data[..], br#"{"action":"I"}"#);
            }
            other => panic!("expected XLogData, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_keepalive() {
        let mut body = vec![b'k'];
        body.extend_from_slice(&0x30u64.to_be_bytes());
        body.extend_from_slice(&1i64.to_be_bytes());
        body.push(1);

        assert_eq!(
            ReplicationMessage::parse(Bytes::from(body)).unwrap(),
            ReplicationMessage::PrimaryKeepalive {
                wal_end: Lsn(0x30),
                server_time_micros: 1,
                reply_requested: true,
            }
        );
    }

    #[test]
    fn test_parse_rejects_truncated_and_unknown() {
        assert!(ReplicationMessage::parse(Bytes::from_static(b"w\0\0")).is_err());
        assert!(ReplicationMessage::parse(Bytes::from_static(b"x")).is_err());
        assert!(ReplicationMessage::parse(Bytes::new()).is_err());
    }

    #[test]
    fn test_standby_status_update_layout() {
        let status = StandbyStatus {
            received: Lsn(3),
            flushed: Lsn(2),
            applied: Lsn(1),
        };
        let mut buf = BytesMut::new();
        standby_status_update(status, 99, false, &mut buf).unwrap();

        assert_eq!(buf[0], b'd');
        let body = copy_data(&mut buf);
        assert_eq!(body.len(), 34);
        assert_eq!(body[0], b'r');
        assert_eq!(&body[1..9], &3u64.to_be_bytes());
        assert_eq!(&body[9..17], &2u64.to_be_bytes());
        assert_eq!(&body[17..25], &1u64.to_be_bytes());
        assert_eq!(&body[25..33], &99i64.to_be_bytes());
        assert_eq!(body[33], 0);
    }

    #[test]
    fn test_db_error_from_error_response() {
        let bytes = frame(
            b'E',
            b"SFEHLER\0VERROR\0C57014\0Mcanceling statement due to user request\0\0",
        );
        let mut buf = BytesMut::from(&bytes[..7]);
        assert!(next_message(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 7);
        buf.extend_from_slice(&bytes[7..]);

        let err = match next_message(&mut buf).unwrap() {
            Some(BackendMessage::Message(Message::ErrorResponse(body))) => db_error(body.fields()),
            _ => panic!("expected ErrorResponse"),
        };
        assert!(err.is_query_canceled());
        assert!(matches!(
            err,
            PgError::Db { ref severity, ref message, .. }
                if severity == "ERROR" && message == "canceling statement due to user request"
        ));
    }

    #[test]
    fn test_db_error_falls_back_to_localized_severity() {
        let bytes = frame(b'N', b"SWARNUNG\0C01000\0Mslot is lagging\0\0");
        let mut buf = BytesMut::from(&bytes[..]);

        let notice = match next_message(&mut buf).unwrap() {
            Some(BackendMessage::Message(Message::NoticeResponse(body))) => db_error(body.fields()),
            _ => panic!("expected NoticeResponse"),
        };
        assert!(matches!(
            notice,
            PgError::Db { ref severity, ref code, .. } if severity == "WARNUNG" && code == "01000"
        ));
    }
}
