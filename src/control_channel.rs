/// 控制通道
///
/// 在一条物理连接上运行按行分帧的 JSON 控制协议。每个通道固定两个后台任务：
/// 读任务只消费入站字节，控制任务是唯一的写者（心跳和排队的控制消息都从这里发出），
/// 两个任务通过同一个 CancellationToken 统一关闭。
use crate::config::TunnelSettings;
use crate::control_protocol::{Command, ControlMessage, MAX_LINE_LENGTH};
use crate::error::{Result, TunnelError};
use crate::transport::Transport;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// 出站消息队列长度
const OUTBOUND_QUEUE_SIZE: usize = 64;

/// 控制通道事件（转发给 Dialer / Listener）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// 对端请求建立新的数据连接
    ConnReady { id: Option<u64>, conn_path: String },

    /// 对端报告 pickup 失败
    PickupFailed { id: Option<u64>, err: String },
}

/// 控制通道句柄
///
/// 克隆开销很小，所有克隆共享同一条物理连接。
#[derive(Clone)]
pub struct ControlChannel {
    label: Arc<str>,
    outbound: mpsc::Sender<ControlMessage>,
    shutdown: CancellationToken,
    closing: Arc<AtomicBool>,
}

impl ControlChannel {
    /// 包装一条已经建立的连接，立即启动读任务和控制任务
    ///
    /// 不会阻塞；必须在 tokio 运行时内调用。
    pub fn spawn<T>(
        conn: T,
        settings: &TunnelSettings,
        label: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<ControlEvent>)
    where
        T: Transport,
    {
        let label: Arc<str> = Arc::from(label.into());
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
        let shutdown = CancellationToken::new();

        let (read_half, write_half) = tokio::io::split(conn);
        let reader = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        let writer = FramedWrite::new(write_half, LinesCodec::new());

        tokio::spawn(read_loop(
            reader,
            event_tx,
            shutdown.clone(),
            settings.read_timeout,
            label.clone(),
        ));
        tokio::spawn(control_loop(
            writer,
            outbound_rx,
            shutdown.clone(),
            settings.keepalive_interval,
            settings.write_timeout,
            label.clone(),
        ));

        debug!("[{}] Control channel started", label);

        let channel = Self {
            label,
            outbound: outbound_tx,
            shutdown,
            closing: Arc::new(AtomicBool::new(false)),
        };
        (channel, event_rx)
    }

    /// 将一条控制消息交给控制任务发送
    pub async fn send(&self, msg: ControlMessage) -> Result<()> {
        if self.is_closed() {
            return Err(TunnelError::DialerClosed);
        }

        tokio::select! {
            _ = self.shutdown.cancelled() => Err(TunnelError::DialerClosed),
            sent = self.outbound.send(msg) => sent.map_err(|_| TunnelError::DialerClosed),
        }
    }

    /// 关闭通道（幂等，可在任意任务中并发调用）
    pub fn close(&self) {
        if !self.closing.swap(true, Ordering::SeqCst) {
            info!("[{}] Closing control channel", self.label);
        }
        self.shutdown.cancel();
    }

    /// 通道关闭后返回
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// 关闭信号，供上层任务在 select 中使用
    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

fn map_codec_error(e: LinesCodecError) -> TunnelError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => TunnelError::framing(format!(
            "control message exceeds {} bytes",
            MAX_LINE_LENGTH
        )),
        LinesCodecError::Io(e) => TunnelError::Io(e),
    }
}

/// 读任务：解析每一行并分发
async fn read_loop<R>(
    mut reader: FramedRead<R, LinesCodec>,
    events: mpsc::UnboundedSender<ControlEvent>,
    shutdown: CancellationToken,
    read_timeout: Duration,
    label: Arc<str>,
) where
    R: AsyncRead + Unpin,
{
    let result: Result<()> = loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            next = tokio::time::timeout(read_timeout, reader.next()) => next,
        };

        let line = match next {
            Err(_) => break Err(TunnelError::timeout(read_timeout)),
            Ok(None) => {
                debug!("[{}] Control connection closed by peer", label);
                break Ok(());
            }
            Ok(Some(Err(e))) => break Err(map_codec_error(e)),
            Ok(Some(Ok(line))) => line,
        };

        let msg = match ControlMessage::decode_line(&line) {
            Ok(msg) => msg,
            Err(e) => break Err(e),
        };

        trace!("[{}] Received control message: {}", label, msg.command);

        match msg.command {
            Command::KeepAlive => {}
            Command::ConnReady => {
                let Some(conn_path) = msg.conn_path else {
                    break Err(TunnelError::framing("conn-ready without connPath"));
                };
                let _ = events.send(ControlEvent::ConnReady {
                    id: msg.id,
                    conn_path,
                });
            }
            Command::PickupFailed => {
                let _ = events.send(ControlEvent::PickupFailed {
                    id: msg.id,
                    err: msg.err.unwrap_or_else(|| "unknown pickup error".to_string()),
                });
            }
        }
    };

    if let Err(e) = result {
        warn!("[{}] Control channel read failed: {}", label, e);
    }
    shutdown.cancel();
}

/// 控制任务：唯一的写者
///
/// 定时发送 keep-alive；有排队消息时立即发送并重置心跳计时器。
async fn control_loop<W>(
    mut writer: FramedWrite<W, LinesCodec>,
    mut outbound: mpsc::Receiver<ControlMessage>,
    shutdown: CancellationToken,
    keepalive_interval: Duration,
    write_timeout: Duration,
    label: Arc<str>,
) where
    W: AsyncWrite + Unpin,
{
    let mut ticker =
        tokio::time::interval_at(Instant::now() + keepalive_interval, keepalive_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let result: Result<()> = loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            _ = ticker.tick() => ControlMessage::keep_alive(),
            msg = outbound.recv() => match msg {
                Some(msg) => {
                    ticker.reset();
                    msg
                }
                None => break Ok(()),
            },
        };

        if let Err(e) = send_message(&mut writer, &msg, write_timeout).await {
            break Err(e);
        }
        trace!("[{}] Sent control message: {}", label, msg.command);
    };

    if let Err(e) = result {
        warn!("[{}] Control channel write failed: {}", label, e);
    }
    shutdown.cancel();
    debug!("[{}] Control channel stopped", label);
}

/// 在写超时内发送一条消息，防止卡住的对端永久阻塞控制任务
async fn send_message<W>(
    writer: &mut FramedWrite<W, LinesCodec>,
    msg: &ControlMessage,
    write_timeout: Duration,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let line = msg.encode_line()?;
    match tokio::time::timeout(write_timeout, writer.send(line)).await {
        Ok(sent) => sent.map_err(map_codec_error),
        Err(_) => Err(TunnelError::timeout(write_timeout)),
    }
}
