//! tokio 이벤트 런타임
//!
//! - AsyncStorage: 지연을 두고 완료를 채널로 통지하는 스토리지
//! - UdpDataTransport: 데이터 채널 (UDP 데이터그램 = key + payload)
//! - SenderHost: 컨트롤 소켓 / 완료 채널 / tick 을 select 하며 세션 핸들러 호출
//! - ReceiverClient: 원본 패스 수신 후 누락 청크가 없을 때까지 재전송 요청

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::chunk::{ChunkGrid, Packet, RoutingKeys, PACKET_SIZE};
use crate::host::{
    Completion, DataTransport, RegionId, Storage, StorageRegions, TransferRequest,
};
use crate::message::{ControlMessage, MissingListRequest};
use crate::receiver::{DecodeEvent, Frame, PassDecoder, PassKind, Reassembler};
use crate::sender::Session;
use crate::stats::TransferStats;
use crate::{Config, Error, Result, RetryPolicy};

/// 동시에 진행 가능한 스토리지 전송 수
pub const MAX_IN_FLIGHT_TRANSFERS: usize = 4;

/// 완료 통지 채널 수신기
pub type CompletionReceiver = mpsc::UnboundedReceiver<Completion>;

/// tokio 태스크로 완료를 지연 통지하는 스토리지
///
/// 데이터는 요청 시점에 읽고, 통지만 `latency` 후에 보냄.
/// 전송 슬롯은 완료 예정 시각이 지나면 회수됨 (통지 태스크 실행 여부와 무관).
pub struct AsyncStorage {
    regions: StorageRegions,
    completion_tx: mpsc::UnboundedSender<Completion>,
    latency: Duration,

    /// 진행 중인 전송의 완료 예정 시각 (오름차순)
    deadlines: VecDeque<Instant>,
    max_in_flight: usize,
}

impl AsyncStorage {
    pub fn new(regions: StorageRegions, latency: Duration) -> (Self, CompletionReceiver) {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let storage = Self {
            regions,
            completion_tx,
            latency,
            deadlines: VecDeque::with_capacity(MAX_IN_FLIGHT_TRANSFERS),
            max_in_flight: MAX_IN_FLIGHT_TRANSFERS,
        };
        (storage, completion_rx)
    }

    pub fn regions(&self) -> &StorageRegions {
        &self.regions
    }

    /// 진행 중인 전송 수
    pub fn in_flight(&self) -> usize {
        let now = Instant::now();
        self.deadlines.iter().filter(|d| **d > now).count()
    }

    /// 만료된 전송 슬롯 회수
    fn reclaim(&mut self, now: Instant) {
        while self.deadlines.front().is_some_and(|d| *d <= now) {
            self.deadlines.pop_front();
        }
    }
}

impl Storage for AsyncStorage {
    fn try_transfer(&mut self, request: &TransferRequest) -> Result<bool> {
        let now = Instant::now();
        self.reclaim(now);
        if self.deadlines.len() >= self.max_in_flight {
            return Ok(false);
        }

        let data = self
            .regions
            .read(request.region, request.byte_offset, request.len)?;
        let completion = Completion {
            tag: request.tag,
            data,
        };

        self.deadlines.push_back(now + self.latency);
        let completion_tx = self.completion_tx.clone();
        let latency = self.latency;

        tokio::spawn(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            let _ = completion_tx.send(completion);
        });

        Ok(true)
    }

    fn allocate(&mut self, bytes: usize) -> Option<RegionId> {
        self.regions.allocate(bytes)
    }

    fn free(&mut self, region: RegionId) {
        self.regions.free(region)
    }

    fn write_words(&mut self, region: RegionId, word_offset: usize, words: &[u32]) -> Result<()> {
        self.regions.write_words(region, word_offset, words)
    }
}

/// UDP 데이터 채널
pub struct UdpDataTransport {
    socket: Arc<UdpSocket>,
    target: Option<SocketAddr>,
    packets_sent: u64,
}

impl UdpDataTransport {
    pub fn new(socket: Arc<UdpSocket>, target: Option<SocketAddr>) -> Self {
        Self {
            socket,
            target,
            packets_sent: 0,
        }
    }

    pub fn target(&self) -> Option<SocketAddr> {
        self.target
    }

    pub fn set_target(&mut self, target: SocketAddr) {
        self.target = Some(target);
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }
}

impl DataTransport for UdpDataTransport {
    fn try_send(&mut self, key: u32, payload: u32) -> bool {
        let target = match self.target {
            Some(target) => target,
            None => {
                debug!("데이터 채널 대상 없음, 패킷 버림");
                return true;
            }
        };

        match self
            .socket
            .try_send_to(&Packet::new(key, payload).to_bytes(), target)
        {
            Ok(_) => {
                self.packets_sent += 1;
                true
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => false,
            Err(e) => {
                // 손실로 취급, 재전송 라운드에서 복구됨
                warn!("데이터 패킷 송신 실패: {}", e);
                true
            }
        }
    }
}

/// SenderHost 정지 핸들
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

/// 송신측 이벤트 루프
pub struct SenderHost {
    session: Session<AsyncStorage, UdpDataTransport>,
    control: UdpSocket,
    completions: CompletionReceiver,
    tick_interval: Duration,
    follow_peer: bool,
    shutdown_rx: watch::Receiver<bool>,
}

impl SenderHost {
    /// 소켓 바인드 및 세션 생성
    ///
    /// `data_target` 이 없으면 마지막 컨트롤 메시지 송신자에게 데이터를 보냄
    pub async fn bind(
        mut config: Config,
        source: Bytes,
        control_addr: SocketAddr,
        data_target: Option<SocketAddr>,
    ) -> Result<(Self, ShutdownHandle)> {
        let control = UdpSocket::bind(control_addr).await?;
        let data_bind: SocketAddr = match control_addr {
            SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
            SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
        };
        let data_socket = Arc::new(UdpSocket::bind(data_bind).await?);

        let bytes_to_write = u32::try_from(source.len()).map_err(|_| {
            Error::InvalidConfig(format!("블록이 너무 큼: {} bytes", source.len()))
        })?;

        // 이벤트 루프 스레드 위에서는 busy spin 대신 양보
        if config.retry_policy == RetryPolicy::Spin {
            config.retry_policy = RetryPolicy::Yield;
        }

        let latency = Duration::from_micros(config.storage_latency_us);
        let tick_interval = Duration::from_millis(config.tick_interval_ms.max(1));
        let (storage, completions) = AsyncStorage::new(StorageRegions::new(source), latency);
        let transport = UdpDataTransport::new(data_socket, data_target);
        let session = Session::new(config, bytes_to_write, storage, transport)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(
            "MCS sender control on {}, data → {}",
            control.local_addr()?,
            data_target.map_or_else(|| "control peer".to_string(), |a| a.to_string())
        );

        let host = Self {
            session,
            control,
            completions,
            tick_interval,
            follow_peer: data_target.is_none(),
            shutdown_rx,
        };
        let handle = ShutdownHandle {
            tx: Arc::new(shutdown_tx),
        };
        Ok((host, handle))
    }

    pub fn control_addr(&self) -> Result<SocketAddr> {
        Ok(self.control.local_addr()?)
    }

    pub fn session(&self) -> &Session<AsyncStorage, UdpDataTransport> {
        &self.session
    }

    /// 정지될 때까지 이벤트 처리, 최종 통계 반환
    pub async fn run(mut self) -> Result<TransferStats> {
        let mut buf = vec![0u8; 65535];
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                received = self.control.recv_from(&mut buf) => {
                    let (len, peer) = received?;
                    if self.follow_peer {
                        self.session.transport_mut().set_target(peer);
                    }
                    // 에러면 세션이 이미 중단/로그 처리함, 다음 요청 대기
                    let _ = self.session.on_control_message(&buf[..len]);
                }
                completion = self.completions.recv() => {
                    let completion = completion.ok_or(Error::ConnectionClosed)?;
                    let _ = self
                        .session
                        .on_transfer_complete(completion.tag, completion.data);
                }
                _ = ticker.tick() => {
                    self.session.on_tick();
                }
                _ = self.shutdown_rx.changed() => {
                    break;
                }
            }
        }

        let stats = self.session.stats().clone();
        info!("MCS sender stopped: {}", stats.summary());
        Ok(stats)
    }
}

/// 수신 결과
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub data: Bytes,

    /// 원본 패스 포함 요청 라운드 수
    pub rounds: usize,

    pub frames_received: u64,
    pub frames_dropped: u64,
    pub crc32: u32,
}

/// 수신측 클라이언트
pub struct ReceiverClient {
    socket: UdpSocket,
    server: SocketAddr,
    config: Config,
    decoder: PassDecoder,
    pass_timeout: Duration,
}

impl ReceiverClient {
    /// 소켓 바인드 (컨트롤 송신과 데이터 수신에 같은 소켓 사용)
    pub async fn connect(config: Config, bind: SocketAddr, server: SocketAddr) -> Result<Self> {
        config.validate()?;
        let socket = UdpSocket::bind(bind).await?;
        info!("MCS receiver on {}, server {}", socket.local_addr()?, server);

        Ok(Self {
            socket,
            server,
            decoder: PassDecoder::new(RoutingKeys::new(config.routing_key), config.items_per_packet)
                .with_max_block_bytes(config.max_block_bytes),
            config,
            pass_timeout: Duration::from_millis(500),
        })
    }

    pub fn with_pass_timeout(mut self, timeout: Duration) -> Self {
        self.pass_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// 블록 전체 수신
    ///
    /// `drop_rate` 비율의 프레임을 일부러 버려 손실을 흉내냄
    pub async fn fetch(&mut self, drop_rate: f64, max_rounds: usize) -> Result<FetchOutcome> {
        let mut reassembler: Option<Reassembler> = None;
        let mut frames_received = 0u64;
        let mut frames_dropped = 0u64;
        let mut rounds = 0usize;

        while rounds < max_rounds {
            rounds += 1;

            let request = match &reassembler {
                None => vec![ControlMessage::SendData],
                Some(r) if r.is_complete() => break,
                Some(r) => {
                    let missing = r.missing();
                    info!(
                        "round {}: {} chunks 누락 ({:.1}% 수신)",
                        rounds,
                        missing.len(),
                        r.receive_ratio() * 100.0
                    );
                    MissingListRequest::encode(&missing, self.config.control_message_words)
                }
            };
            for message in &request {
                self.socket.send_to(&message.to_bytes(), self.server).await?;
            }

            let (frames, kind) = self.receive_pass().await?;
            if reassembler.is_none() {
                reassembler = match (self.decoder.grid(), kind) {
                    (Some(grid), _) => Some(Reassembler::new(grid)),
                    // 빈 블록: sentinel 만 옴
                    (None, Some(PassKind::Empty)) => Some(Reassembler::new(ChunkGrid::new(
                        0,
                        self.config.items_per_packet,
                    ))),
                    (None, _) => None,
                };
            }

            let reassembler = match reassembler.as_mut() {
                Some(r) => r,
                None => continue,
            };
            let mut rng = rand::thread_rng();
            for frame in &frames {
                if drop_rate > 0.0 && rng.gen_bool(drop_rate.min(1.0)) {
                    frames_dropped += 1;
                    continue;
                }
                if reassembler.insert(frame) {
                    frames_received += 1;
                }
            }
        }

        let reassembler = reassembler.ok_or(Error::ConnectionClosed)?;
        if !reassembler.is_complete() {
            return Err(Error::TransferIncomplete {
                missing: reassembler.missing().len(),
            });
        }

        let data = reassembler.into_bytes()?;
        let crc32 = crc32fast::hash(&data);
        info!(
            "수신 완료: {} bytes, {} rounds, crc32={:08X}",
            data.len(),
            rounds,
            crc32
        );

        Ok(FetchOutcome {
            data,
            rounds,
            frames_received,
            frames_dropped,
            crc32,
        })
    }

    /// 패스 하나가 끝날 때까지 수신 (타임아웃 시 받은 만큼 반환)
    async fn receive_pass(&mut self) -> Result<(Vec<Frame>, Option<PassKind>)> {
        let mut buf = [0u8; 64];
        let mut frames = Vec::new();

        loop {
            let received =
                tokio::time::timeout(self.pass_timeout, self.socket.recv_from(&mut buf)).await;
            let (len, _) = match received {
                Ok(result) => result?,
                Err(_) => {
                    warn!("패스 종료 대기 타임아웃, {} frames 수신", frames.len());
                    return Ok((frames, None));
                }
            };

            if len != PACKET_SIZE {
                continue;
            }
            let packet = match Packet::from_bytes(&buf[..len]) {
                Some(packet) => packet,
                None => continue,
            };

            for event in self.decoder.push(packet) {
                match event {
                    DecodeEvent::Frame(frame) => frames.push(frame),
                    DecodeEvent::PassEnd(summary) => {
                        debug!("패스 종료: {:?}", summary);
                        return Ok((frames, Some(summary.kind)));
                    }
                }
            }
        }
    }
}
