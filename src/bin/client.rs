//! MCS 수신자 - Multicast Chunk Stream
//!
//! SEND_DATA 로 원본 전송을 요청하고, 블록이 완성될 때까지 누락 목록을 보냄
//! - `--drop` 으로 프레임 손실을 흉내내어 재전송 경로 확인
//!
//! 사용법:
//!   cargo run --release --bin mcstream-receiver -- [OPTIONS]
//!
//! 예시:
//!   # 기본 수신
//!   cargo run --release --bin mcstream-receiver -- --server 127.0.0.1:9000 --output received.bin
//!
//!   # 20% 손실 + 테스트 패턴 검증
//!   cargo run --release --bin mcstream-receiver -- -s 127.0.0.1:9000 --drop 0.2 --verify-pattern

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Instant;

use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use mcstream::host::test_pattern;
use mcstream::{Config, ReceiverClient};

/// 수신자 설정
struct ReceiverConfig {
    bind_addr: SocketAddr,
    server_addr: SocketAddr,
    output_path: Option<PathBuf>,
    drop_rate: f64,
    max_rounds: usize,
    verify_pattern: bool,
    config: Config,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:0".parse().unwrap(),
            server_addr: "127.0.0.1:9000".parse().unwrap(),
            output_path: None,
            drop_rate: 0.0,
            max_rounds: 32,
            verify_pattern: false,
            config: Config::default(),
        }
    }
}

fn parse_args() -> ReceiverConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ReceiverConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--server" | "-s" => {
                if i + 1 < args.len() {
                    config.server_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    config.bind_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--output" | "-o" => {
                if i + 1 < args.len() {
                    config.output_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--key" | "-k" => {
                if i + 1 < args.len() {
                    let value = &args[i + 1];
                    config.config.routing_key = match value.strip_prefix("0x") {
                        Some(hex) => u32::from_str_radix(hex, 16).expect("유효한 16진수 필요"),
                        None => value.parse().expect("유효한 숫자 필요"),
                    };
                    i += 1;
                }
            }
            "--drop" => {
                if i + 1 < args.len() {
                    config.drop_rate = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--rounds" => {
                if i + 1 < args.len() {
                    config.max_rounds = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--max-block" => {
                if i + 1 < args.len() {
                    config.config.max_block_bytes =
                        args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--verify-pattern" => {
                config.verify_pattern = true;
            }
            "--help" | "-h" => {
                println!(
                    r#"MCS Receiver - Multicast Chunk Stream 수신자

사용법:
  cargo run --release --bin mcstream-receiver -- [OPTIONS]

옵션:
  -s, --server <ADDR>     송신자 컨트롤 주소 (기본: 127.0.0.1:9000)
  -b, --bind <ADDR>       바인드 주소 (기본: 0.0.0.0:0)
  -o, --output <PATH>     수신 데이터 저장 경로
  -k, --key <KEY>         라우팅 키 (기본: 0x10000)
  --drop <RATIO>          일부러 버릴 프레임 비율 0.0~1.0 (기본: 0)
  --rounds <N>            최대 요청 라운드 수 (기본: 32)
  --max-block <BYTES>     받아들일 최대 블록 길이 (기본: 268435456)
  --verify-pattern        테스트 패턴 (word i = i) 과 비교
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

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let receiver_config = parse_args();

    info!("MCS Receiver starting...");
    info!("Server: {}", receiver_config.server_addr);
    info!("Drop rate: {:.1}%", receiver_config.drop_rate * 100.0);

    let mut client = ReceiverClient::connect(
        receiver_config.config,
        receiver_config.bind_addr,
        receiver_config.server_addr,
    )
    .await?;

    let start = Instant::now();
    let outcome = client
        .fetch(receiver_config.drop_rate, receiver_config.max_rounds)
        .await?;
    let elapsed = start.elapsed();

    info!("═══════════════════════════════════════════");
    info!("Received: {} bytes in {:.2}s", outcome.data.len(), elapsed.as_secs_f64());
    info!("Rounds: {}", outcome.rounds);
    info!(
        "Frames: {} accepted, {} dropped",
        outcome.frames_received, outcome.frames_dropped
    );
    info!("CRC32: {:08X}", outcome.crc32);
    info!("═══════════════════════════════════════════");

    if receiver_config.verify_pattern {
        if outcome.data == test_pattern(outcome.data.len()) {
            info!("테스트 패턴 일치");
        } else {
            error!("테스트 패턴 불일치");
            std::process::exit(1);
        }
    }

    if let Some(path) = &receiver_config.output_path {
        std::fs::write(path, &outcome.data)?;
        info!("Saved to {:?}", path);
    }

    Ok(())
}
