use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use clap::Parser;
use frame_link::Publisher;
use photo_cache::cache::{CacheBudget, CacheManager};
use photo_cache::config::{Configuration, SourceConfig};
use photo_cache::pipeline::{PhotoPipeline, PipelineSettings};
use photo_cache::processing::crop::CropResizer;
use photo_cache::processing::decode::HeifConverter;
use photo_cache::processing::faces::{CommandFaceDetector, FaceDetector, NoFaceDetector};
use photo_cache::rejection::RejectionSet;
use photo_cache::source::{AuthOutcome, ImmichSource, LibrarySource, PhotoSource};
use photo_cache::tasks::{self, AcquisitionWorker, DisplayedLog, StatusReporter, WorkerSettings};
use photo_cache::web::{self, ControlState};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

#[derive(Debug, Parser)]
#[command(
    name = "photo-cache",
    version,
    about = "Keeps a bounded cache of display-ready photos for the frame"
)]
struct Args {
    /// Path to YAML config
    #[arg(value_name = "CONFIG")]
    config: PathBuf,
    /// Exit once every photo has been attempted instead of waiting for a stop signal
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // init tracing (RUST_LOG controls level, default = info)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let Args { config, once } = Args::parse();

    let cfg = Configuration::from_yaml_file(&config)
        .with_context(|| format!("failed to load configuration from {}", config.display()))?
        .validated()
        .context("invalid configuration values")?;
    tracing::info!(
        config = %config.display(),
        working_dir = %cfg.working_dir.display(),
        album = cfg.album_label(),
        frame = ?cfg.frame,
        "loaded configuration"
    );

    let budget = CacheBudget::for_directory(
        &cfg.working_dir,
        cfg.max_space_bytes(),
        cfg.disk_reserve_bytes(),
    )
    .context("failed to compute cache budget")?;
    let cache = CacheManager::initialize(&cfg.working_dir, budget, cfg.eviction_retry_limit)
        .context("failed to initialize cache")?;
    let cache = Arc::new(Mutex::new(cache));
    let rejections = RejectionSet::load(&cfg.rejection_file).with_context(|| {
        format!(
            "failed to read rejection list {}",
            cfg.rejection_file.display()
        )
    })?;
    let rejections = Arc::new(Mutex::new(rejections));

    let publisher = Arc::new(
        Publisher::bind(cfg.status_channel.publish_addr.as_str())
            .await
            .context("failed to open status channel")?,
    );
    let reporter = StatusReporter::new(Some(publisher.clone()));

    let source = build_source(&cfg).await?;
    let detector: Arc<dyn FaceDetector> = match &cfg.face_detector {
        Some(detector) => Arc::new(CommandFaceDetector::new(
            detector.command.clone(),
            cfg.scratch_dir.clone(),
        )),
        None => Arc::new(NoFaceDetector),
    };
    let pipeline = Arc::new(PhotoPipeline::new(
        PipelineSettings::from_config(&cfg),
        CropResizer::new(cfg.frame, detector),
        HeifConverter::new(cfg.convert_command.clone()),
    ));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!("ctrl-c handler failed: {err}");
                return;
            }
            tracing::info!("ctrl-c received; initiating shutdown");
            cancel.cancel();
        });
    }

    #[cfg(unix)]
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = sigterm.recv() => {
                            tracing::info!("SIGTERM received; initiating shutdown");
                            cancel.cancel();
                        }
                    }
                }
                Err(err) => tracing::warn!("failed to register SIGTERM handler: {err}"),
            }
        });
    }

    // Services outlive the worker and stop after it has been joined.
    let services = CancellationToken::new();
    let displayed = Arc::new(Mutex::new(DisplayedLog::default()));
    let mut tasks = JoinSet::new();

    tasks.spawn({
        let addr = cfg.status_channel.command_addr.clone();
        let cache = cache.clone();
        let displayed = displayed.clone();
        let services = services.clone();
        async move {
            tasks::commands::run(addr, cache, displayed, services)
                .await
                .context("command task failed")
        }
    });

    if let Some(control) = &cfg.control {
        let state = ControlState {
            cache: cache.clone(),
            rejections: rejections.clone(),
            reporter: reporter.clone(),
            displayed: displayed.clone(),
            publisher: Some(publisher.clone()),
            album: Arc::from(cfg.album_label()),
        };
        let bind_addr = control.bind_addr.clone();
        let services = services.clone();
        tasks.spawn(async move {
            web::serve(&bind_addr, state, services)
                .await
                .context("control surface failed")
        });
    }

    let worker = AcquisitionWorker::new(
        source,
        pipeline,
        cache,
        rejections,
        reporter,
        WorkerSettings::from_config(&cfg),
    );
    match tokio::spawn(worker.run(cancel.clone())).await {
        Ok(Ok(last)) => tracing::info!(
            status = ?last.status,
            processed = last.num_processed_photos,
            failed = last.num_failed_photos,
            "acquisition worker stopped"
        ),
        Ok(Err(e)) => tracing::error!("worker error: {e:?}"),
        Err(e) => tracing::error!("worker join error: {e}"),
    }

    if !once {
        cancel.cancelled().await;
    }
    services.cancel();

    while let Some(res) = tasks.join_next().await {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("task error: {e:?}"),
            Err(e) => tracing::error!("join error: {e}"),
        }
    }
    publisher.shutdown().await;

    Ok(())
}

async fn build_source(cfg: &Configuration) -> Result<Arc<dyn PhotoSource>> {
    match &cfg.source {
        SourceConfig::Library { path } => Ok(Arc::new(LibrarySource::new(path.clone()))),
        SourceConfig::Immich {
            server_url,
            user,
            password,
        } => {
            let source = Arc::new(ImmichSource::new(server_url, cfg.album_name.clone()));
            let login = source.clone();
            let (user, password) = (user.clone(), password.clone());
            let outcome = tokio::task::spawn_blocking(move || login.authenticate(&user, &password))
                .await
                .context("login task failed")?
                .context("failed to log in to Immich")?;
            if outcome == AuthOutcome::MfaRequired {
                bail!("the Immich account requires a second factor, which is not supported");
            }
            Ok(source)
        }
    }
}
