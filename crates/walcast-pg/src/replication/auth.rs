//! Password authentication for the replication connection.

use fallible_iterator::FallibleIterator;
use postgres_protocol::authentication::{self, sasl};
use postgres_protocol::message::backend::{AuthenticationSaslBody, Message};
use postgres_protocol::message::frontend;
use tracing::debug;

use super::connection::WireStream;
use super::params::ConnectionParams;
use super::protocol::{db_error, BackendMessage};
use crate::error::{PgError, PgResult};

/// Answer the server's authentication requests until it reports success.
pub(crate) async fn authenticate(wire: &mut WireStream, params: &ConnectionParams) -> PgResult<()> {
    loop {
        let BackendMessage::Message(msg) = wire.recv().await? else {
            continue;
        };
        match msg {
            Message::AuthenticationOk => {
                debug!(user = %params.user, "Authenticated");
                return Ok(());
            }
            Message::AuthenticationCleartextPassword => {
                frontend::password_message(password(params)?, wire.write_buf())?;
                wire.flush().await?;
            }
            Message::AuthenticationMd5Password(body) => {
                let hash =
                    authentication::md5_hash(params.user.as_bytes(), password(params)?, body.salt());
                frontend::password_message(hash.as_bytes(), wire.write_buf())?;
                wire.flush().await?;
            }
            Message::AuthenticationSasl(body) => scram_sha_256(wire, params, &body).await?,
            Message::AuthenticationKerberosV5
            | Message::AuthenticationScmCredential
            | Message::AuthenticationGss
            | Message::AuthenticationGssContinue(_)
            | Message::AuthenticationSspi => {
                return Err(PgError::Auth(
                    "server requested an unsupported authentication method".into(),
                ))
            }
            Message::ErrorResponse(body) => return Err(db_error(body.fields())),
            _ => {}
        }
    }
}

async fn scram_sha_256(
    wire: &mut WireStream,
    params: &ConnectionParams,
    body: &AuthenticationSaslBody,
) -> PgResult<()> {
    let offered = body
        .mechanisms()
        .any(|m| Ok(m == sasl::SCRAM_SHA_256))?;
    if !offered {
        return Err(PgError::Auth("server does not offer SCRAM-SHA-256".into()));
    }

    let mut scram = sasl::ScramSha256::new(password(params)?, sasl::ChannelBinding::unsupported());
    frontend::sasl_initial_response(sasl::SCRAM_SHA_256, scram.message(), wire.write_buf())?;
    wire.flush().await?;

    let server_first = match sasl_message(wire).await? {
        Message::AuthenticationSaslContinue(body) => body,
        _ => return Err(PgError::Auth("expected SASL continue message".into())),
    };
    scram
        .update(server_first.data())
        .map_err(|e| PgError::Auth(e.to_string()))?;
    frontend::sasl_response(scram.message(), wire.write_buf())?;
    wire.flush().await?;

    let server_final = match sasl_message(wire).await? {
        Message::AuthenticationSaslFinal(body) => body,
        _ => return Err(PgError::Auth("expected SASL final message".into())),
    };
    scram
        .finish(server_final.data())
        .map_err(|e| PgError::Auth(e.to_string()))
}

/// Next step of a SASL exchange. Anything but SASL continue/final is an error.
async fn sasl_message(wire: &mut WireStream) -> PgResult<Message> {
    loop {
        match wire.recv().await? {
            BackendMessage::Message(Message::ErrorResponse(body)) => {
                return Err(db_error(body.fields()))
            }
            BackendMessage::Message(
                msg @ (Message::AuthenticationSaslContinue(_) | Message::AuthenticationSaslFinal(_)),
            ) => return Ok(msg),
            BackendMessage::Message(Message::NoticeResponse(_)) => {}
            _ => {
                return Err(PgError::Auth(
                    "unexpected message during SCRAM exchange".into(),
                ))
            }
        }
    }
}

fn password(params: &ConnectionParams) -> PgResult<&[u8]> {
    if params.password.is_empty() {
        return Err(PgError::Auth("server requested a password but none was given".into()));
    }
    Ok(params.password.as_bytes())
}
