//! High-level client for the MAGIC control protocol.
//!
//! [`MagicClient`] owns the TCP connection to the gateway, correlates
//! answers with their requests by envelope id, and diverts server-initiated
//! messages (MNTR, MSCR) into a push inbox the application drains at its
//! own pace.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use magic_models::{
    AccountingControlAnswer, AccountingControlRequest, AccountingDataAnswer,
    AccountingDataRequest, AnswerStatus, AuthenticationAnswer, AuthenticationRequest, ClientId,
    CommunicationChangeAnswer, CommunicationChangeRequest, CommunicationRequest, MagicEnvelope,
    MagicMessage, NotificationAck, Realm, SessionId, SessionTerminationAnswer,
    SessionTerminationRequest, StatusAnswer, StatusRequest,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::SdkError;

/// Default answer deadline.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<MagicEnvelope>>>>;

/// A connected control-protocol participant.
pub struct MagicClient {
    origin_host: ClientId,
    origin_realm: Realm,
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    pending: PendingMap,
    pushes: Option<mpsc::UnboundedReceiver<MagicEnvelope>>,
    request_timeout: Duration,
    reader: tokio::task::JoinHandle<()>,
}

impl Drop for MagicClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl MagicClient {
    /// Connect to the gateway's control socket.
    ///
    /// # Errors
    ///
    /// Fails when the TCP connection cannot be established.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        origin_host: &str,
        origin_realm: &str,
    ) -> Result<Self, SdkError> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (push_tx, push_rx) = mpsc::unbounded_channel();

        let reader_pending = pending.clone();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(text)) => {
                        if text.trim().is_empty() {
                            continue;
                        }
                        let envelope = match serde_json::from_str::<MagicEnvelope>(&text) {
                            Ok(env) => env,
                            Err(e) => {
                                warn!(error = %e, "malformed envelope from gateway");
                                continue;
                            }
                        };
                        let waiter = envelope.correlation_id.as_ref().and_then(|corr| {
                            reader_pending.lock().unwrap().remove(corr)
                        });
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(envelope);
                            }
                            None => {
                                debug!(
                                    command = envelope.payload.mnemonic(),
                                    "server push received"
                                );
                                if push_tx.send(envelope).is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(error = %e, "control connection read failed");
                        break;
                    }
                }
            }
        });

        Ok(MagicClient {
            origin_host: ClientId::new(origin_host),
            origin_realm: Realm::new(origin_realm),
            writer: Arc::new(tokio::sync::Mutex::new(write_half)),
            pending,
            pushes: Some(push_rx),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reader,
        })
    }

    /// Override the answer deadline.
    pub fn set_request_timeout(&mut self, timeout: Duration) {
        self.request_timeout = timeout;
    }

    /// Take the push inbox. Server-initiated notifications and broadcasts
    /// arrive here; the inbox can be taken once.
    pub fn take_pushes(&mut self) -> Option<mpsc::UnboundedReceiver<MagicEnvelope>> {
        self.pushes.take()
    }

    /// Send one request and await its correlated answer.
    ///
    /// # Errors
    ///
    /// Transport failures, the deadline, or a closed connection.
    pub async fn request(
        &self,
        session_id: &SessionId,
        payload: MagicMessage,
    ) -> Result<MagicEnvelope, SdkError> {
        let envelope = MagicEnvelope::new(
            session_id.clone(),
            self.origin_host.clone(),
            self.origin_realm.clone(),
            payload,
        );
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap()
            .insert(envelope.id.to_string(), tx);

        if let Err(e) = self.write(&envelope).await {
            self.pending
                .lock()
                .unwrap()
                .remove(&envelope.id.to_string());
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(answer)) => Ok(answer),
            Ok(Err(_)) => Err(SdkError::ConnectionClosed),
            Err(_) => {
                self.pending
                    .lock()
                    .unwrap()
                    .remove(&envelope.id.to_string());
                Err(SdkError::Timeout)
            }
        }
    }

    /// Fire-and-forget send (acknowledgements).
    ///
    /// # Errors
    ///
    /// Transport failures only.
    pub async fn send(
        &self,
        session_id: &SessionId,
        payload: MagicMessage,
    ) -> Result<(), SdkError> {
        let envelope = MagicEnvelope::new(
            session_id.clone(),
            self.origin_host.clone(),
            self.origin_realm.clone(),
            payload,
        );
        self.write(&envelope).await
    }

    async fn write(&self, envelope: &MagicEnvelope) -> Result<(), SdkError> {
        let mut payload = serde_json::to_vec(envelope)?;
        payload.push(b'\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(&payload).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Typed commands
    // ------------------------------------------------------------------

    /// CAR: authenticate, optionally with a zero-round-trip admission
    /// request and a status subscription.
    ///
    /// # Errors
    ///
    /// Transport failures or an unexpected answer type. Protocol-level
    /// rejections are returned inside the answer, not as errors.
    pub async fn authenticate(
        &self,
        session_id: &SessionId,
        username: &str,
        password: &str,
        communication_request: Option<CommunicationRequest>,
    ) -> Result<AuthenticationAnswer, SdkError> {
        self.authenticate_with_subscription(
            session_id,
            username,
            password,
            None,
            communication_request,
        )
        .await
    }

    /// CAR with an explicit status-subscription level.
    ///
    /// # Errors
    ///
    /// See [`authenticate`](Self::authenticate).
    pub async fn authenticate_with_subscription(
        &self,
        session_id: &SessionId,
        username: &str,
        password: &str,
        status_subscription: Option<u8>,
        communication_request: Option<CommunicationRequest>,
    ) -> Result<AuthenticationAnswer, SdkError> {
        let answer = self
            .request(
                session_id,
                MagicMessage::AuthenticationRequest(AuthenticationRequest {
                    username: Some(username.to_string()),
                    client_password: Some(password.to_string()),
                    status_subscription,
                    communication_request,
                }),
            )
            .await?;
        match answer.payload {
            MagicMessage::AuthenticationAnswer(caa) => Ok(caa),
            other => Err(SdkError::UnexpectedAnswer {
                got: other.mnemonic(),
            }),
        }
    }

    /// CCR: request, modify, stop or queue a communication.
    ///
    /// # Errors
    ///
    /// Transport failures or an unexpected answer type.
    pub async fn change_communication(
        &self,
        session_id: &SessionId,
        communication_request: CommunicationRequest,
    ) -> Result<CommunicationChangeAnswer, SdkError> {
        let answer = self
            .request(
                session_id,
                MagicMessage::CommunicationChangeRequest(CommunicationChangeRequest {
                    communication_request,
                }),
            )
            .await?;
        match answer.payload {
            MagicMessage::CommunicationChangeAnswer(cca) => Ok(cca),
            other => Err(SdkError::UnexpectedAnswer {
                got: other.mnemonic(),
            }),
        }
    }

    /// STR: terminate the session.
    ///
    /// # Errors
    ///
    /// Transport failures or an unexpected answer type.
    pub async fn terminate(
        &self,
        session_id: &SessionId,
    ) -> Result<SessionTerminationAnswer, SdkError> {
        let answer = self
            .request(
                session_id,
                MagicMessage::SessionTerminationRequest(SessionTerminationRequest::default()),
            )
            .await?;
        match answer.payload {
            MagicMessage::SessionTerminationAnswer(sta) => Ok(sta),
            other => Err(SdkError::UnexpectedAnswer {
                got: other.mnemonic(),
            }),
        }
    }

    /// SXR: query gateway / link status.
    ///
    /// # Errors
    ///
    /// Transport failures or an unexpected answer type.
    pub async fn request_status(
        &self,
        session_id: &SessionId,
        status_type: u8,
    ) -> Result<StatusAnswer, SdkError> {
        let answer = self
            .request(
                session_id,
                MagicMessage::StatusRequest(StatusRequest { status_type }),
            )
            .await?;
        match answer.payload {
            MagicMessage::StatusAnswer(sxa) => Ok(sxa),
            other => Err(SdkError::UnexpectedAnswer {
                got: other.mnemonic(),
            }),
        }
    }

    /// ADR: retrieve accounting records.
    ///
    /// # Errors
    ///
    /// Transport failures or an unexpected answer type.
    pub async fn request_accounting_data(
        &self,
        session_id: &SessionId,
        request: AccountingDataRequest,
    ) -> Result<AccountingDataAnswer, SdkError> {
        let answer = self
            .request(session_id, MagicMessage::AccountingDataRequest(request))
            .await?;
        match answer.payload {
            MagicMessage::AccountingDataAnswer(ada) => Ok(ada),
            other => Err(SdkError::UnexpectedAnswer {
                got: other.mnemonic(),
            }),
        }
    }

    /// ACR: roll the target session's billing over without disconnecting.
    ///
    /// # Errors
    ///
    /// Transport failures or an unexpected answer type.
    pub async fn rollover_accounting(
        &self,
        session_id: &SessionId,
        restart_session_id: &SessionId,
    ) -> Result<AccountingControlAnswer, SdkError> {
        let answer = self
            .request(
                session_id,
                MagicMessage::AccountingControlRequest(AccountingControlRequest {
                    restart_session_id: restart_session_id.clone(),
                }),
            )
            .await?;
        match answer.payload {
            MagicMessage::AccountingControlAnswer(aca) => Ok(aca),
            other => Err(SdkError::UnexpectedAnswer {
                got: other.mnemonic(),
            }),
        }
    }

    /// Acknowledge a notification report so the gateway may resume
    /// notifications for the session.
    ///
    /// # Errors
    ///
    /// Transport failures only.
    pub async fn acknowledge_notification(&self, session_id: &SessionId) -> Result<(), SdkError> {
        self.send(
            session_id,
            MagicMessage::NotificationAck(NotificationAck {
                status: AnswerStatus::success(),
            }),
        )
        .await
    }
}

/// Turn a failed answer status into an [`SdkError::Rejected`], passing
/// successes through.
///
/// # Errors
///
/// [`SdkError::Rejected`] when the status is not a success.
pub fn ensure_success(status: &AnswerStatus) -> Result<(), SdkError> {
    if status.is_success() {
        return Ok(());
    }
    Err(SdkError::Rejected {
        result: status.result_code,
        status: status.magic_status,
        message: status.error_message.clone().unwrap_or_default(),
    })
}
