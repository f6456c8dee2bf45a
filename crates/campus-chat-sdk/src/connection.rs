//! 连接管理
//!
//! [`ConnectionManager`] 只维护状态机，不做 I/O：事件循环根据返回的决策去
//! 打开连接、调度重连定时器或广播致命错误。
//!
//! 每次打开连接都分配新的代数（generation），来自旧代数的 open 结果和
//! 传输事件一律丢弃，保证任意时刻最多一个存活连接。

use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::connection_state::ConnectionStatus;
use crate::error::{ChatError, Result};
use crate::retry_policy::ReconnectPolicy;
use crate::transport::Credential;

pub type ConnectWaiter = oneshot::Sender<Result<()>>;

/// `connect` 调用的处理结果
#[derive(Debug, PartialEq, Eq)]
pub enum ConnectDecision {
    /// 已连接，调用方已收到成功
    AlreadyConnected,
    /// 加入正在进行的连接尝试
    Joined,
    /// 需要以该代数发起一次 open
    Start { generation: u64 },
}

/// open 结果的处理结论
#[derive(Debug, PartialEq)]
pub enum OpenOutcome {
    /// 来自旧代数，连接（若有）应立即关闭
    Stale,
    Connected { reconnected: bool },
    /// 首次连接失败，已通知调用方，不自动重连
    Failed(ChatError),
    /// 重连失败，调度下一次
    Retry { attempt: u32, delay: Duration },
    /// 不可恢复
    Fatal(ChatError),
}

/// 连接关闭的处理结论
#[derive(Debug, PartialEq)]
pub enum CloseOutcome {
    Ignored,
    /// 正常关闭，不重连
    Stopped,
    Reconnect { attempt: u32, delay: Duration },
    Fatal(ChatError),
}

pub struct ConnectionManager {
    status: ConnectionStatus,
    generation: u64,
    attempt: u32,
    credential: Option<Credential>,
    policy: ReconnectPolicy,
    waiters: Vec<ConnectWaiter>,
    auto_reconnect: bool,
    /// 当前 open 属于重连流程
    reconnecting: bool,
}

impl ConnectionManager {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            generation: 0,
            attempt: 0,
            credential: None,
            policy,
            waiters: Vec::new(),
            auto_reconnect: false,
            reconnecting: false,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    pub fn begin_connect(&mut self, credential: Credential, waiter: ConnectWaiter) -> ConnectDecision {
        match self.status {
            ConnectionStatus::Connected => {
                let _ = waiter.send(Ok(()));
                ConnectDecision::AlreadyConnected
            }
            ConnectionStatus::Connecting => {
                self.waiters.push(waiter);
                ConnectDecision::Joined
            }
            ConnectionStatus::Disconnected => {
                self.attempt = 0;
                self.reconnecting = false;
                self.start(credential, waiter)
            }
            ConnectionStatus::Reconnecting => {
                // 跳过剩余退避，立即尝试
                info!("🔄 重连等待中收到 connect，立即尝试 (attempt={})", self.attempt);
                self.start(credential, waiter)
            }
        }
    }

    fn start(&mut self, credential: Credential, waiter: ConnectWaiter) -> ConnectDecision {
        self.credential = Some(credential);
        self.auto_reconnect = true;
        self.waiters.push(waiter);
        self.status = ConnectionStatus::Connecting;
        self.generation += 1;
        ConnectDecision::Start {
            generation: self.generation,
        }
    }

    /// 重连定时器到期，返回新的代数
    pub fn on_reconnect_timer(&mut self) -> Option<u64> {
        if self.status != ConnectionStatus::Reconnecting || self.credential.is_none() {
            return None;
        }
        self.status = ConnectionStatus::Connecting;
        self.generation += 1;
        Some(self.generation)
    }

    pub fn on_open_result(&mut self, generation: u64, result: Result<()>) -> OpenOutcome {
        if generation != self.generation || self.status != ConnectionStatus::Connecting {
            return OpenOutcome::Stale;
        }
        match result {
            Ok(()) => {
                let reconnected = self.reconnecting;
                self.status = ConnectionStatus::Connected;
                self.attempt = 0;
                self.reconnecting = false;
                self.resolve_waiters(Ok(()));
                info!("✅ 连接建立 generation={} reconnected={}", generation, reconnected);
                OpenOutcome::Connected { reconnected }
            }
            Err(err @ ChatError::Auth(_)) => {
                warn!("🔐 认证失败，停止自动重连: {}", err);
                self.stop();
                self.resolve_waiters(Err(err.clone()));
                OpenOutcome::Fatal(err)
            }
            Err(err) if self.reconnecting => {
                warn!("重连第 {} 次失败: {}", self.attempt, err);
                self.resolve_waiters(Err(err));
                match self.next_backoff() {
                    CloseOutcome::Reconnect { attempt, delay } => OpenOutcome::Retry { attempt, delay },
                    CloseOutcome::Fatal(err) => OpenOutcome::Fatal(err),
                    CloseOutcome::Ignored | CloseOutcome::Stopped => OpenOutcome::Stale,
                }
            }
            Err(err) => {
                warn!("❌ 首次连接失败: {}", err);
                self.stop();
                self.resolve_waiters(Err(err.clone()));
                OpenOutcome::Failed(err)
            }
        }
    }

    /// 当前连接被关闭（服务端关闭、传输错误或心跳判死）
    pub fn on_closed(&mut self, generation: u64, normal: bool) -> CloseOutcome {
        if generation != self.generation || self.status != ConnectionStatus::Connected {
            return CloseOutcome::Ignored;
        }
        if normal || !self.auto_reconnect {
            info!("连接正常关闭 generation={}", generation);
            self.stop();
            return CloseOutcome::Stopped;
        }
        warn!("⚠️ 连接异常断开 generation={}，准备重连", generation);
        self.next_backoff()
    }

    fn next_backoff(&mut self) -> CloseOutcome {
        self.attempt += 1;
        match self.policy.delay_for(self.attempt) {
            Some(delay) => {
                self.status = ConnectionStatus::Reconnecting;
                self.reconnecting = true;
                CloseOutcome::Reconnect {
                    attempt: self.attempt,
                    delay,
                }
            }
            None => {
                let attempts = self.attempt - 1;
                self.stop();
                CloseOutcome::Fatal(ChatError::ConnectionLost { attempts })
            }
        }
    }

    /// 调用方主动断开：作废进行中的连接尝试，不再自动重连。
    /// 返回之前的状态。
    pub fn explicit_close(&mut self) -> ConnectionStatus {
        let previous = self.status;
        self.stop();
        self.attempt = 0;
        self.generation += 1;
        self.resolve_waiters(Err(ChatError::Closed("disconnect requested".to_string())));
        previous
    }

    /// 关闭时让所有等待中的调用方失败
    pub fn fail_waiters(&mut self, err: ChatError) {
        self.resolve_waiters(Err(err));
    }

    fn stop(&mut self) {
        self.status = ConnectionStatus::Disconnected;
        self.auto_reconnect = false;
        self.reconnecting = false;
    }

    fn resolve_waiters(&mut self, result: Result<()>) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectConfig;

    fn manager() -> ConnectionManager {
        ConnectionManager::new(ReconnectPolicy::new(ReconnectConfig::default()))
    }

    fn credential() -> Credential {
        Credential::new("u1", "t")
    }

    fn connect(mgr: &mut ConnectionManager) -> (ConnectDecision, oneshot::Receiver<Result<()>>) {
        let (tx, rx) = oneshot::channel();
        (mgr.begin_connect(credential(), tx), rx)
    }

    #[test]
    fn test_concurrent_connects_collapse() {
        let mut mgr = manager();
        let (first, mut rx1) = connect(&mut mgr);
        assert_eq!(first, ConnectDecision::Start { generation: 1 });
        let (second, mut rx2) = connect(&mut mgr);
        assert_eq!(second, ConnectDecision::Joined);

        assert_eq!(
            mgr.on_open_result(1, Ok(())),
            OpenOutcome::Connected { reconnected: false }
        );
        assert_eq!(rx1.try_recv().unwrap(), Ok(()));
        assert_eq!(rx2.try_recv().unwrap(), Ok(()));

        let (third, mut rx3) = connect(&mut mgr);
        assert_eq!(third, ConnectDecision::AlreadyConnected);
        assert_eq!(rx3.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn test_abnormal_close_walks_backoff_then_fatal() {
        let mut mgr = manager();
        let _ = connect(&mut mgr);
        mgr.on_open_result(1, Ok(()));

        assert_eq!(
            mgr.on_closed(1, false),
            CloseOutcome::Reconnect {
                attempt: 1,
                delay: Duration::from_millis(3000)
            }
        );
        assert_eq!(mgr.status(), ConnectionStatus::Reconnecting);

        let mut expected = vec![4500u64, 6750, 10125, 15187].into_iter();
        loop {
            let generation = mgr.on_reconnect_timer().unwrap();
            match mgr.on_open_result(generation, Err(ChatError::Transport("refused".into()))) {
                OpenOutcome::Retry { delay, .. } => {
                    assert_eq!(delay.as_millis() as u64, expected.next().unwrap());
                }
                OpenOutcome::Fatal(err) => {
                    assert_eq!(err, ChatError::ConnectionLost { attempts: 5 });
                    break;
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(expected.next().is_none());
        assert_eq!(mgr.status(), ConnectionStatus::Disconnected);
        assert!(mgr.on_reconnect_timer().is_none());
    }

    #[test]
    fn test_successful_reconnect_resets_attempts() {
        let mut mgr = manager();
        let _ = connect(&mut mgr);
        mgr.on_open_result(1, Ok(()));
        mgr.on_closed(1, false);
        let generation = mgr.on_reconnect_timer().unwrap();
        assert_eq!(
            mgr.on_open_result(generation, Ok(())),
            OpenOutcome::Connected { reconnected: true }
        );
        assert_eq!(mgr.attempt(), 0);
    }

    #[test]
    fn test_normal_close_and_stale_events() {
        let mut mgr = manager();
        let _ = connect(&mut mgr);
        mgr.on_open_result(1, Ok(()));
        // 旧代数的事件被忽略
        assert_eq!(mgr.on_closed(0, false), CloseOutcome::Ignored);
        assert_eq!(mgr.on_closed(1, true), CloseOutcome::Stopped);
        assert_eq!(mgr.status(), ConnectionStatus::Disconnected);
        assert_eq!(mgr.on_closed(1, false), CloseOutcome::Ignored);
    }

    #[test]
    fn test_auth_failure_is_terminal() {
        let mut mgr = manager();
        let (_, mut rx) = connect(&mut mgr);
        let outcome = mgr.on_open_result(1, Err(ChatError::Auth("bad token".into())));
        assert!(matches!(outcome, OpenOutcome::Fatal(ChatError::Auth(_))));
        assert!(matches!(rx.try_recv().unwrap(), Err(ChatError::Auth(_))));
        assert_eq!(mgr.status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_initial_failure_does_not_reconnect() {
        let mut mgr = manager();
        let (_, mut rx) = connect(&mut mgr);
        let outcome = mgr.on_open_result(1, Err(ChatError::Transport("refused".into())));
        assert!(matches!(outcome, OpenOutcome::Failed(_)));
        assert!(rx.try_recv().unwrap().is_err());
        assert_eq!(mgr.status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_explicit_close_invalidates_inflight_open() {
        let mut mgr = manager();
        let (_, mut rx) = connect(&mut mgr);
        assert_eq!(mgr.explicit_close(), ConnectionStatus::Connecting);
        assert!(matches!(rx.try_recv().unwrap(), Err(ChatError::Closed(_))));
        assert_eq!(mgr.on_open_result(1, Ok(())), OpenOutcome::Stale);
        assert_eq!(mgr.status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_connect_while_reconnecting_starts_now() {
        let mut mgr = manager();
        let _ = connect(&mut mgr);
        mgr.on_open_result(1, Ok(()));
        mgr.on_closed(1, false);
        let (decision, _rx) = connect(&mut mgr);
        assert_eq!(decision, ConnectDecision::Start { generation: 2 });
        assert_eq!(mgr.status(), ConnectionStatus::Connecting);
        // 依旧属于重连流程，失败后进入下一次退避
        assert!(matches!(
            mgr.on_open_result(2, Err(ChatError::Transport("x".into()))),
            OpenOutcome::Retry { attempt: 2, .. }
        ));
    }
}
