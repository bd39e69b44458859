//! 권한 핸드셰이크
//!
//! 요청측: Idle → RequestSent → {Granted, Denied, Error}
//! 응답측: Idle → AwaitingApproval → {ApprovalGranted, ApprovalDenied}
//!
//! 거절은 종료 상태이며 자동 재시도는 없음

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::chunk::FileDescriptor;
use crate::connection::{Connection, ConnectionHandle};
use crate::encoder::TransferEncoder;
use crate::message::{Message, PermissionGrantedMessage};
use crate::peer::PeerId;
use crate::stats::TransferStats;
use crate::validation::TransferOffer;
use crate::{Config, Error, Result};

/// 요청측 상태
#[derive(Debug, Clone, PartialEq)]
pub enum RequesterState {
    Idle,
    RequestSent,
    Granted,
    Denied,
    Error(String),
}

impl fmt::Display for RequesterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequesterState::Idle => write!(f, "idle"),
            RequesterState::RequestSent => write!(f, "request-sent"),
            RequesterState::Granted => write!(f, "granted"),
            RequesterState::Denied => write!(f, "denied"),
            RequesterState::Error(_) => write!(f, "error"),
        }
    }
}

/// 응답측 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponderState {
    Idle,
    AwaitingApproval,
    ApprovalGranted,
    ApprovalDenied,
}

impl fmt::Display for ResponderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResponderState::Idle => "idle",
            ResponderState::AwaitingApproval => "awaiting-approval",
            ResponderState::ApprovalGranted => "approval-granted",
            ResponderState::ApprovalDenied => "approval-denied",
        };
        f.write_str(name)
    }
}

fn invalid(from: impl fmt::Display, to: &str) -> Error {
    Error::InvalidTransition {
        from: from.to_string(),
        to: to.to_string(),
    }
}

/// 권한 요청측
#[derive(Debug)]
pub struct PermissionRequester {
    state: RequesterState,
    timeout: Duration,
    deadline: Option<Instant>,
}

impl PermissionRequester {
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: RequesterState::Idle,
            timeout,
            deadline: None,
        }
    }

    pub fn state(&self) -> &RequesterState {
        &self.state
    }

    /// 응답 기한 (요청 전이면 None)
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// `request-permission` 전송 후 기한 설정
    pub async fn request_access(&mut self, handle: &ConnectionHandle) -> Result<()> {
        if self.state != RequesterState::Idle {
            return Err(invalid(&self.state, "request-sent"));
        }

        handle.send(Message::RequestPermission).await?;
        self.state = RequesterState::RequestSent;
        self.deadline = Some(Instant::now() + self.timeout);
        debug!("permission requested from {}", handle.peer());
        Ok(())
    }

    /// 응답 메시지 반영
    ///
    /// 승인이면 파일 목록을 돌려주고, 거절이면 `PermissionDenied`
    pub fn on_response(&mut self, message: Message) -> Result<PermissionGrantedMessage> {
        if self.state != RequesterState::RequestSent {
            return Err(invalid(&self.state, message.type_name()));
        }
        self.deadline = None;

        match message {
            Message::PermissionGranted(granted) => {
                self.state = RequesterState::Granted;
                Ok(granted)
            }
            Message::PermissionDenied => {
                self.state = RequesterState::Denied;
                Err(Error::PermissionDenied)
            }
            Message::TransferError(err) => {
                self.state = RequesterState::Error(err.message.clone());
                Err(Error::Transfer(err.message))
            }
            other => {
                let err = Error::UnexpectedMessage {
                    expected: "permission-granted".to_string(),
                    got: other.type_name().to_string(),
                };
                self.state = RequesterState::Error(err.to_string());
                Err(err)
            }
        }
    }

    /// 기한 만료 처리
    pub fn on_timeout(&mut self) -> Error {
        self.deadline = None;
        self.state = RequesterState::Error(Error::PermissionTimeout.to_string());
        Error::PermissionTimeout
    }

    /// 연결 에러 반영
    pub fn on_failure(&mut self, err: &Error) {
        self.deadline = None;
        self.state = RequesterState::Error(err.to_string());
    }

    /// 기한 안에 응답 대기
    pub async fn await_response(&mut self, conn: &mut Connection) -> Result<PermissionGrantedMessage> {
        let deadline = match self.deadline {
            Some(deadline) => deadline,
            None => return Err(invalid(&self.state, "awaiting-response")),
        };

        match tokio::time::timeout_at(deadline, conn.next_message()).await {
            Ok(Ok(message)) => self.on_response(message),
            Ok(Err(e)) => {
                self.on_failure(&e);
                Err(e)
            }
            Err(_) => Err(self.on_timeout()),
        }
    }
}

/// 승인 결정 협력자 (UI)
pub trait Approver: Send + Sync + 'static {
    fn approve(&self, peer: &PeerId, offer: &TransferOffer) -> impl Future<Output = bool> + Send;
}

/// 고정 결정
impl Approver for bool {
    fn approve(&self, _peer: &PeerId, _offer: &TransferOffer) -> impl Future<Output = bool> + Send {
        std::future::ready(*self)
    }
}

/// async 클로저 어댑터
pub struct FnApprover<F>(pub F);

impl<F, Fut> Approver for FnApprover<F>
where
    F: Fn(PeerId, Vec<FileDescriptor>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send,
{
    fn approve(&self, peer: &PeerId, offer: &TransferOffer) -> impl Future<Output = bool> + Send {
        (self.0)(peer.clone(), offer.descriptors())
    }
}

/// 권한 응답측
#[derive(Debug)]
pub struct PermissionResponder {
    state: ResponderState,
}

impl Default for PermissionResponder {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionResponder {
    pub fn new() -> Self {
        Self {
            state: ResponderState::Idle,
        }
    }

    pub fn state(&self) -> ResponderState {
        self.state
    }

    /// 요청 메시지 수신
    pub fn on_request(&mut self, message: &Message) -> Result<()> {
        if !matches!(message, Message::RequestPermission) {
            return Err(Error::UnexpectedMessage {
                expected: "request-permission".to_string(),
                got: message.type_name().to_string(),
            });
        }
        if self.state != ResponderState::Idle {
            return Err(invalid(self.state, "awaiting-approval"));
        }
        self.state = ResponderState::AwaitingApproval;
        Ok(())
    }

    /// 승인/거절 응답
    ///
    /// 승인하면 파일 목록을 보낸 뒤 바로 인코더를 실행하고 통계를 돌려줌.
    /// 거절하면 `permission-denied`만 보내고 None
    pub async fn respond(
        &mut self,
        handle: &ConnectionHandle,
        approve: bool,
        offer: &TransferOffer,
        config: &Config,
    ) -> Result<Option<TransferStats>> {
        if self.state != ResponderState::AwaitingApproval {
            let to = if approve { "approval-granted" } else { "approval-denied" };
            return Err(invalid(self.state, to));
        }

        if !approve {
            self.state = ResponderState::ApprovalDenied;
            handle.send(Message::PermissionDenied).await?;
            info!("Denied transfer request from {}", handle.peer());
            return Ok(None);
        }

        self.state = ResponderState::ApprovalGranted;
        let file_list = offer.file_list();
        handle
            .send(Message::PermissionGranted(PermissionGrantedMessage {
                file_count: file_list.len() as u32,
                file_list,
            }))
            .await?;
        info!(
            "Granted transfer to {} ({} files, {} bytes)",
            handle.peer(),
            offer.files().len(),
            offer.total_size()
        );

        let mut encoder = TransferEncoder::new(config.clone());
        encoder.send_files(handle, offer.files()).await?;
        Ok(Some(encoder.stats().clone()))
    }
}
