//! MCS 송신자 - Multicast Chunk Stream
//!
//! 컨트롤 채널로 SEND_DATA / 누락 목록을 받아 소스 블록을 데이터 채널로 송신
//! - 이중 버퍼 비동기 읽기로 송신과 읽기 겹침
//! - 누락 시퀀스만 재전송
//!
//! 사용법:
//!   cargo run --release --bin mcstream-sender -- [OPTIONS]
//!
//! 예시:
//!   # 테스트 패턴 1MB
//!   cargo run --release --bin mcstream-sender -- --control 0.0.0.0:9000 --size 1048576
//!
//!   # 파일 전송, 데이터는 고정 주소로
//!   cargo run --release --bin mcstream-sender -- -f data.bin --data 239.0.0.1:9001

use std::net::SocketAddr;
use std::path::PathBuf;

use bytes::Bytes;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use mcstream::config::Descriptor;
use mcstream::host::test_pattern;
use mcstream::{Config, RetryPolicy, SenderHost};

/// 송신자 설정
struct SenderConfig {
    control_addr: SocketAddr,
    data_target: Option<SocketAddr>,
    file_path: Option<PathBuf>,
    descriptor_path: Option<PathBuf>,
    size: Option<u32>,
    config: Config,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            control_addr: "0.0.0.0:9000".parse().unwrap(),
            data_target: None,
            file_path: None,
            descriptor_path: None,
            size: None,
            config: Config::default(),
        }
    }
}

fn parse_args() -> SenderConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = SenderConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--control" | "-c" => {
                if i + 1 < args.len() {
                    config.control_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--data" | "-d" => {
                if i + 1 < args.len() {
                    config.data_target = Some(args[i + 1].parse().expect("유효한 주소 필요"));
                    i += 1;
                }
            }
            "--key" | "-k" => {
                if i + 1 < args.len() {
                    config.config.routing_key = parse_u32(&args[i + 1]);
                    i += 1;
                }
            }
            "--size" | "-s" => {
                if i + 1 < args.len() {
                    config.size = Some(args[i + 1].parse().expect("유효한 숫자 필요"));
                    i += 1;
                }
            }
            "--file" | "-f" => {
                if i + 1 < args.len() {
                    config.file_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--descriptor" => {
                if i + 1 < args.len() {
                    config.descriptor_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--items" => {
                if i + 1 < args.len() {
                    config.config.items_per_packet = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--retry-limit" => {
                if i + 1 < args.len() {
                    config.config.retry_policy = RetryPolicy::Bounded {
                        max_attempts: args[i + 1].parse().expect("유효한 숫자 필요"),
                    };
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!(
                    r#"MCS Sender - Multicast Chunk Stream 송신자

사용법:
  cargo run --release --bin mcstream-sender -- [OPTIONS]

옵션:
  -c, --control <ADDR>    컨트롤 채널 바인드 주소 (기본: 0.0.0.0:9000)
  -d, --data <ADDR>       데이터 채널 대상 주소 (기본: 컨트롤 메시지 송신자)
  -k, --key <KEY>         라우팅 키 (10진수 또는 0x 16진수, 기본: 0x10000)
  -s, --size <BYTES>      테스트 패턴 블록 크기 (기본: 1048576)
  -f, --file <PATH>       전송할 파일 (테스트 패턴 대신)
  --descriptor <PATH>     기동 descriptor (라우팅 키, 블록 크기)
  --items <N>             전송 버퍼 워드 수, 헤더 포함 (기본: 68)
  --retry-limit <N>       송신/읽기 재시도 상한 (기본: 무제한)
  -h, --help              이 도움말 출력
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    config
}

fn parse_u32(value: &str) -> u32 {
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).expect("유효한 16진수 필요"),
        None => value.parse().expect("유효한 숫자 필요"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut sender_config = parse_args();

    if let Some(path) = &sender_config.descriptor_path {
        let params = Descriptor::load(path)?.session_params()?;
        info!(
            "Descriptor: key={:08X}, bytes={}",
            params.routing_key, params.bytes_to_write
        );
        sender_config.config.routing_key = params.routing_key;
        sender_config.size.get_or_insert(params.bytes_to_write);
    }

    // 전송할 데이터 준비
    let source = if let Some(path) = &sender_config.file_path {
        info!("Loading file: {:?}", path);
        Bytes::from(std::fs::read(path)?)
    } else {
        let size = sender_config.size.unwrap_or(1024 * 1024);
        info!("Using test pattern ({} bytes)", size);
        test_pattern(size as usize)
    };

    info!("MCS Sender starting...");
    info!("Routing key: {:08X}", sender_config.config.routing_key);
    info!("Block size: {} bytes", source.len());
    info!("Items per packet: {}", sender_config.config.items_per_packet);
    info!("Source CRC32: {:08X}", crc32fast::hash(&source));

    let (host, shutdown) = SenderHost::bind(
        sender_config.config,
        source,
        sender_config.control_addr,
        sender_config.data_target,
    )
    .await?;

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C, 종료 중...");
            shutdown.shutdown();
        }
    });

    let stats = host.run().await?;
    info!("Final: {}", stats.summary());
    Ok(())
}
