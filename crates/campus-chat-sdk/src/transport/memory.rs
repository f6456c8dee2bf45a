//! 内存传输
//!
//! 测试用的假服务端：可以脚本化每次 `open` 的结果，查看客户端写出的帧，
//! 主动推送入站帧或断开连接。配合 tokio 暂停时钟可以做确定性测试。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::{Credential, Transport, TransportEvent, TransportLink, TransportSink};
use crate::codec::{decode_frame, encode_frame, Frame, FrameType, Method};
use crate::error::{ChatError, Result};

/// 单次 `open` 的行为
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenBehavior {
    /// 接受连接
    Accept,
    /// 认证失败
    RejectAuth,
    /// 网络失败
    Fail,
    /// 永不返回，用于测试连接超时
    Hang,
}

#[derive(Default)]
struct Script {
    queue: VecDeque<OpenBehavior>,
    fallback: Option<OpenBehavior>,
}

/// 内存传输工厂
#[derive(Clone, Default)]
pub struct MemoryTransport {
    script: Arc<Mutex<Script>>,
    peers: Arc<Mutex<Vec<MemoryPeer>>>,
    opens: Arc<AtomicU32>,
    auto_heartbeat: Arc<AtomicBool>,
}

impl MemoryTransport {
    /// 默认接受所有连接，并自动回复心跳
    pub fn new() -> Self {
        let transport = Self::default();
        transport.auto_heartbeat.store(true, Ordering::SeqCst);
        transport
    }

    /// 追加接下来几次 `open` 的行为，用完后回到默认行为
    pub fn script(&self, behaviors: impl IntoIterator<Item = OpenBehavior>) {
        self.script.lock().queue.extend(behaviors);
    }

    /// 修改脚本用完后的默认行为
    pub fn set_default_behavior(&self, behavior: OpenBehavior) {
        self.script.lock().fallback = Some(behavior);
    }

    /// 新建连接是否自动回复心跳探测
    pub fn set_auto_heartbeat(&self, enabled: bool) {
        self.auto_heartbeat.store(enabled, Ordering::SeqCst);
    }

    /// `open` 被调用的次数（含失败）
    pub fn open_count(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    /// 第 `index` 条被接受的连接
    pub fn peer(&self, index: usize) -> Option<MemoryPeer> {
        self.peers.lock().get(index).cloned()
    }

    pub fn last_peer(&self) -> Option<MemoryPeer> {
        self.peers.lock().last().cloned()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    /// 仍然打开的连接数
    pub fn live_connections(&self) -> usize {
        self.peers.lock().iter().filter(|p| p.is_open()).count()
    }

    fn next_behavior(&self) -> OpenBehavior {
        let mut script = self.script.lock();
        script
            .queue
            .pop_front()
            .or(script.fallback)
            .unwrap_or(OpenBehavior::Accept)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, credential: &Credential) -> Result<TransportLink> {
        let attempt = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
        let behavior = self.next_behavior();
        debug!("内存传输 open #{} user={} -> {:?}", attempt, credential.user_id, behavior);

        match behavior {
            OpenBehavior::Accept => {}
            OpenBehavior::RejectAuth => {
                return Err(ChatError::Auth(format!("token rejected for {}", credential.user_id)))
            }
            OpenBehavior::Fail => return Err(ChatError::Transport("connection refused".to_string())),
            OpenBehavior::Hang => std::future::pending::<()>().await,
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let peer = MemoryPeer {
            inner: Arc::new(PeerInner {
                credential: credential.clone(),
                events: tx,
                sent: Mutex::new(Vec::new()),
                open: AtomicBool::new(true),
                fail_sends: AtomicU32::new(0),
                auto_heartbeat: AtomicBool::new(self.auto_heartbeat.load(Ordering::SeqCst)),
                client_close_code: Mutex::new(None),
            }),
        };
        self.peers.lock().push(peer.clone());

        Ok(TransportLink {
            sink: Box::new(MemorySink { peer }),
            events: rx,
        })
    }
}

struct PeerInner {
    credential: Credential,
    events: mpsc::UnboundedSender<TransportEvent>,
    sent: Mutex<Vec<Bytes>>,
    open: AtomicBool,
    fail_sends: AtomicU32,
    auto_heartbeat: AtomicBool,
    client_close_code: Mutex<Option<u16>>,
}

/// 服务端视角的一条连接
#[derive(Clone)]
pub struct MemoryPeer {
    inner: Arc<PeerInner>,
}

impl MemoryPeer {
    pub fn credential(&self) -> &Credential {
        &self.inner.credential
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// 客户端写出的原始数据
    pub fn sent_raw(&self) -> Vec<Bytes> {
        self.inner.sent.lock().clone()
    }

    /// 客户端写出的帧（解码后）
    pub fn sent_frames(&self) -> Vec<Frame> {
        self.inner
            .sent
            .lock()
            .iter()
            .filter_map(|raw| decode_frame(raw).ok())
            .collect()
    }

    /// 客户端写出的非心跳帧
    pub fn sent_data_frames(&self) -> Vec<Frame> {
        self.sent_frames()
            .into_iter()
            .filter(|f| f.frame_type != FrameType::Heartbeat)
            .collect()
    }

    /// 向客户端推送一帧
    pub fn push(&self, frame: &Frame) {
        if let Ok(bytes) = encode_frame(frame) {
            self.push_raw(bytes);
        }
    }

    /// 向客户端推送原始数据（可以是非法内容）
    pub fn push_raw(&self, payload: impl Into<Bytes>) {
        if self.is_open() {
            let _ = self.inner.events.send(TransportEvent::Message(payload.into()));
        }
    }

    /// 服务端关闭连接
    pub fn close(&self, code: u16, reason: &str) {
        if self.inner.open.swap(false, Ordering::SeqCst) {
            let _ = self.inner.events.send(TransportEvent::Closed {
                code,
                reason: reason.to_string(),
            });
        }
    }

    /// 模拟网络错误
    pub fn fail(&self, reason: &str) {
        if self.inner.open.swap(false, Ordering::SeqCst) {
            let _ = self.inner.events.send(TransportEvent::Error(reason.to_string()));
        }
    }

    /// 接下来的 `count` 次写入失败
    pub fn fail_next_sends(&self, count: u32) {
        self.inner.fail_sends.store(count, Ordering::SeqCst);
    }

    pub fn auto_heartbeat(&self, enabled: bool) {
        self.inner.auto_heartbeat.store(enabled, Ordering::SeqCst);
    }

    /// 客户端主动关闭时使用的关闭码
    pub fn client_close_code(&self) -> Option<u16> {
        *self.inner.client_close_code.lock()
    }
}

struct MemorySink {
    peer: MemoryPeer,
}

#[async_trait]
impl TransportSink for MemorySink {
    async fn send(&self, payload: Bytes) -> Result<()> {
        let inner = &self.peer.inner;
        if !inner.open.load(Ordering::SeqCst) {
            return Err(ChatError::Transport("connection closed".to_string()));
        }
        let consumed = inner
            .fail_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            return Err(ChatError::Transport("write failed".to_string()));
        }

        let probe = if inner.auto_heartbeat.load(Ordering::SeqCst) {
            decode_frame(&payload)
                .ok()
                .filter(|f| f.frame_type == FrameType::Heartbeat)
        } else {
            None
        };
        inner.sent.lock().push(payload);

        if let Some(probe) = probe {
            self.peer.push(&Frame::new(
                FrameType::Heartbeat,
                probe.id,
                Method::Heartbeat,
                serde_json::Value::Null,
            ));
        }
        Ok(())
    }

    async fn close(&self, code: u16, _reason: &str) {
        let inner = &self.peer.inner;
        if inner.open.swap(false, Ordering::SeqCst) {
            *inner.client_close_code.lock() = Some(code);
        }
    }
}
