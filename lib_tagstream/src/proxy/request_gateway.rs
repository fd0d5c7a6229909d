//! # Request/Reply Gateway
//!
//! Synchronous request/reply over the broker:
//!
//! 1. open a transacted session on the live connection
//! 2. create a temporary reply queue
//! 3. send the encoded request with `reply_to` set, and commit
//! 4. wait on the temporary queue for at most `timeout`
//!
//! The session is closed on every path, which also releases the temporary queue.

use std::time::Duration;

use crate::broker::{BrokerConnection, BrokerMessage, BrokerSession, Destination, SessionMode};
use crate::codec::ClientRequest;
use crate::error::ProxyError;

pub(crate) async fn send_request<R>(
    connection: Option<&dyn BrokerConnection>,
    request: &R,
    queue_name: &str,
    timeout: Duration,
) -> Result<R::Response, ProxyError>
where
    R: ClientRequest + ?Sized,
{
    let Some(connection) = connection else {
        return Err(ProxyError::NotConnected("cannot send request".to_string()));
    };
    if queue_name.trim().is_empty() {
        return Err(ProxyError::InvalidArgument("request queue name must not be empty".to_string()));
    }
    let text = request.to_wire()?;

    let session = connection.create_session(SessionMode::Transacted).await?;
    let reply = exchange(session.as_ref(), text, queue_name, timeout).await;
    if let Err(e) = session.close().await {
        log::warn!("Failed to close request session for {}: {}", queue_name, e);
    }

    match reply? {
        Some(message) => Ok(request.from_wire_response(&message.text)?),
        None => {
            log::warn!("No reply received on {} within {:?}", queue_name, timeout);
            Err(ProxyError::Timeout { queue: queue_name.to_string(), timeout })
        }
    }
}

async fn exchange(
    session: &dyn BrokerSession,
    text: String,
    queue_name: &str,
    timeout: Duration,
) -> Result<Option<BrokerMessage>, ProxyError> {
    let reply_queue = session.create_temporary_queue().await?;
    let message = BrokerMessage::text(text).with_reply_to(reply_queue.clone());
    session.send(&Destination::Queue(queue_name.to_string()), message).await?;
    session.commit().await?;
    log::debug!("Request sent to {}; waiting on {}", queue_name, reply_queue);
    Ok(session.receive(&reply_queue, timeout).await?)
}
