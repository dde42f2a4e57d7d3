use clap::{App, Arg};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use trackcam::cloud::{LoopbackCloud, PublishedEvent};
use trackcam::config::TrackerConfig;
use trackcam::subsystems::location::LOCATION_EVENT;
use trackcam::subsystems::{CameraAdapter, LocationTracker, SimulatedRail};
use trackcam::upload::{
    AssemblyOutcome, CallRetryQueue, CameraRequest, CompletedImage, ImageAssembler, UploadError, CAMERA_COMMAND,
    CAMERA_EVENT,
};
use trackcam::{CommandInvocation, CommandResult, Orchestrator};

const DEFAULT_PORT: &str = "8080";
const DEFAULT_DATA_DIR: &str = "images";
const BACKEND_POLL_MS: u64 = 50;

#[derive(serde::Serialize)]
struct CommandReply<'a> {
    name: &'a str,
    result: CommandResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("trackcam-device")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Simulated asset tracker with camera accessory")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Port for remote function calls")
                .takes_value(true)
                .default_value(DEFAULT_PORT),
        )
        .arg(
            Arg::with_name("data-dir")
                .short("d")
                .long("data-dir")
                .value_name("DIR")
                .help("Where the loopback backend stores received images")
                .takes_value(true)
                .default_value(DEFAULT_DATA_DIR),
        )
        .get_matches();

    let config = match matches.value_of("config") {
        Some(path) => TrackerConfig::load(path)?,
        None => TrackerConfig::default(),
    };
    let port: u16 = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse()?;
    let data_dir = PathBuf::from(matches.value_of("data-dir").unwrap_or(DEFAULT_DATA_DIR));

    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.log_filter))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cloud = Arc::new(LoopbackCloud::new(config.cloud.clone()));
    let location = Arc::new(LocationTracker::new(config.location.clone(), Arc::clone(&cloud)));
    let camera = Arc::new(CameraAdapter::new(
        config.camera.clone(),
        SimulatedRail::new(),
        Arc::clone(&cloud),
    ));

    let transfer_camera = Arc::clone(&camera);
    let mut orchestrator = Orchestrator::new(location, camera, Arc::clone(&cloud), config.orchestrator.clone())
        .with_command(CAMERA_COMMAND, move |argument| transfer_camera.handle_transfer_request(argument));

    let report = orchestrator.initialize()?;
    if report.is_degraded() {
        warn!(target: "app", "running degraded: {:?}", report);
    }

    tokio::fs::create_dir_all(&data_dir).await?;
    let backend_cloud = Arc::clone(&cloud);
    let retries = CallRetryQueue::new(config.backend.call_retry_ms);
    let assembler = ImageAssembler::new(config.backend.clone());
    tokio::spawn(async move {
        if let Err(e) = run_backend(backend_cloud, assembler, retries, data_dir).await {
            error!(target: "app", "backend error: {}", e);
        }
    });

    let server_cloud = Arc::clone(&cloud);
    tokio::spawn(async move {
        if let Err(e) = start_tcp_server(server_cloud, port).await {
            error!(target: "app", "TCP server error: {}", e);
        }
    });

    let mut interval = time::interval(Duration::from_millis(config.orchestrator.tick_period_ms));
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => orchestrator.tick(),
            _ = tokio::signal::ctrl_c() => {
                info!(target: "app", "shutting down after {} ticks", orchestrator.get_stats().tick_count);
                break;
            }
        }
    }

    Ok(())
}

async fn start_tcp_server(cloud: Arc<LoopbackCloud>, port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    info!(target: "app", "accepting function calls on port {}", port);

    loop {
        let (stream, addr) = listener.accept().await?;
        debug!(target: "app", "client connected: {}", addr);

        let client_cloud = Arc::clone(&cloud);
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, client_cloud).await {
                warn!(target: "app", "client {} error: {}", addr, e);
            }
        });
    }
}

async fn handle_client(stream: TcpStream, cloud: Arc<LoopbackCloud>) -> Result<(), Box<dyn std::error::Error>> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<CommandInvocation>(line) {
            Ok(invocation) => match cloud.call_function(&invocation.name, &invocation.argument) {
                Ok(result) => serde_json::to_string(&CommandReply {
                    name: &invocation.name,
                    result,
                    error: None,
                })?,
                Err(e) => serde_json::to_string(&CommandReply {
                    name: &invocation.name,
                    result: CommandResult::NOT_READY,
                    error: Some(e.to_string()),
                })?,
            },
            Err(e) => serde_json::to_string(&CommandReply {
                name: "",
                result: CommandResult::MALFORMED_ARGUMENT,
                error: Some(format!("invalid invocation: {}", e)),
            })?,
        };

        writer.write_all(reply.as_bytes()).await?;
        writer.write_all(b"\n").await?;
    }

    Ok(())
}

/// Stands in for the cloud side: consumes published events and answers the camera.
async fn run_backend(
    cloud: Arc<LoopbackCloud>,
    mut assembler: ImageAssembler,
    mut retries: CallRetryQueue,
    data_dir: PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    let epoch = Instant::now();
    let mut interval = time::interval(Duration::from_millis(BACKEND_POLL_MS));

    loop {
        interval.tick().await;
        let now_ms = epoch.elapsed().as_millis() as u64;

        for event in cloud.drain_published() {
            let requests = match handle_event(&mut assembler, &event, now_ms) {
                Ok(Some(outcome)) => {
                    if let Some(image) = outcome.completed {
                        save_image(&data_dir, &image).await?;
                    }
                    outcome.requests
                }
                Ok(None) => Vec::new(),
                Err(e) => {
                    warn!(target: "app.cloud", "dropping `{}` event: {}", event.name, e);
                    Vec::new()
                }
            };
            for request in requests {
                send_or_defer(&cloud, &mut retries, request, now_ms);
            }
        }

        if let Some(request) = assembler.poll(now_ms) {
            send_or_defer(&cloud, &mut retries, request, now_ms);
        }
        for request in retries.take_due(now_ms) {
            send_or_defer(&cloud, &mut retries, request, now_ms);
        }
    }
}

fn handle_event(
    assembler: &mut ImageAssembler,
    event: &PublishedEvent,
    now_ms: u64,
) -> Result<Option<AssemblyOutcome>, UploadError> {
    match event.name.as_str() {
        LOCATION_EVENT => assembler.on_location(&event.data).map(|()| None),
        CAMERA_EVENT => assembler.on_camera_data(&event.data, now_ms).map(Some),
        other => {
            debug!(target: "app.cloud", "ignoring event `{}`", other);
            Ok(None)
        }
    }
}

/// Calls that never reached the device are queued and retried later.
fn send_or_defer(cloud: &LoopbackCloud, retries: &mut CallRetryQueue, request: CameraRequest, now_ms: u64) {
    let argument = match serde_json::to_string(&request) {
        Ok(argument) => argument,
        Err(e) => {
            warn!(target: "app.cloud", "failed to encode camera request: {}", e);
            return;
        }
    };
    match cloud.call_function(CAMERA_COMMAND, &argument) {
        Ok(result) if result.is_accepted() => debug!(target: "app.cloud", "camera accepted {}", argument),
        Ok(result) => warn!(target: "app.cloud", "camera answered {} to {}", result, argument),
        Err(e) => {
            warn!(target: "app.cloud", "camera request not delivered: {}", e);
            retries.defer(request, now_ms);
        }
    }
}

async fn save_image(data_dir: &Path, image: &CompletedImage) -> Result<(), Box<dyn std::error::Error>> {
    let image_path = data_dir.join(&image.file_name);
    tokio::fs::write(&image_path, &image.data).await?;

    if let Some(location) = &image.location {
        let meta_path = image_path.with_extension("json");
        tokio::fs::write(&meta_path, serde_json::to_vec_pretty(location)?).await?;
    }

    info!(
        target: "app.cloud",
        "saved {} ({} bytes) to {}",
        image.file_name,
        image.data.len(),
        image_path.display()
    );
    Ok(())
}
