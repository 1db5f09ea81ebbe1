//! Starting the signer daemon.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use log::{error, info};
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::oneshot;
use crate::commons::file;
use crate::commons::error::Error;
use crate::config::Config;
use crate::manager::TokenManager;
use crate::ocsp::OcspRefresher;
use crate::ocsp::cache::OcspCache;
use crate::ocsp::fetch::{HttpFetcher, OcspFetcher};
use crate::registry::TokenRegistry;
use crate::registry::store::RegistryStore;
use crate::service::SigningService;
use super::HttpServer;
use super::scheduler::Scheduler;


/// Runs the signer until it is interrupted.
///
/// Once the listener is bound, its address is sent through
/// `signal_running`. Returns `Ok(())` after a Ctrl-C and an error if the
/// listener or the scheduler stop on their own.
pub async fn start_signer_daemon(
    config: Arc<Config>,
    signal_running: Option<oneshot::Sender<SocketAddr>>,
) -> Result<(), Error> {
    test_data_dir(&config.data_dir)?;

    let registry = Arc::new(
        TokenRegistry::load(RegistryStore::disk(&config.data_dir)?)?
    );
    let manager = Arc::new(TokenManager::new(
        registry.clone(), TokenManager::modules_from_config(&config)
    ));

    // Find the devices before the first request comes in.
    let initial = manager.clone();
    tokio::task::spawn_blocking(move || initial.discover()).await.map_err(
        |err| Error::internal(format!("initial discovery aborted: {err}"))
    )??;

    let ocsp = Arc::new(OcspCache::new(&config.ocsp));
    let fetcher = HttpFetcher::new(&config.ocsp).map_err(|err| {
        Error::internal(format!("cannot set up OCSP fetcher: {err}"))
    })?;
    let refresher = OcspRefresher::new(
        ocsp.clone(), registry, OcspFetcher::Http(fetcher),
        config.ocsp.fetch_timeout(),
    );
    let scheduler = Scheduler::new(
        manager.clone(), refresher,
        config.discovery_interval(), config.ocsp.refresh_interval(),
    );

    let service = Arc::new(SigningService::new(
        manager.clone(), ocsp, config.multiple_active_certs
    ));
    let server = Arc::new(HttpServer::new(service, &config));

    let addr = config.socket_addr();
    let listener = TcpListener::bind(addr).await.map_err(|err| {
        Error::internal(format!("Could not bind to {addr}: {err}"))
    })?;
    let local_addr = listener.local_addr().map_err(|err| {
        Error::internal(format!("Could not bind to {addr}: {err}"))
    })?;
    info!("Listening for RPC requests on {local_addr}");
    if let Some(tx) = signal_running {
        let _ = tx.send(local_addr);
    }

    let res = select!(
        _ = tokio::spawn(serve_listener(listener, server)) => {
            Err(Error::internal("RPC listener stopped unexpectedly"))
        }
        _ = scheduler.run() => {
            Err(Error::internal("scheduler stopped unexpectedly"))
        }
        res = tokio::signal::ctrl_c() => {
            match res {
                Ok(()) => {
                    info!("Shutting down");
                    Ok(())
                }
                Err(err) => {
                    Err(Error::internal(
                        format!("cannot listen for shutdown signal: {err}")
                    ))
                }
            }
        }
    );

    manager.shutdown();
    res
}

/// Serves RPC requests on a bound listener.
///
/// Only returns if accepting connections fails.
pub async fn serve_listener(listener: TcpListener, server: Arc<HttpServer>) {
    loop {
        let stream = match listener.accept().await {
            Ok((stream, _addr)) => stream,
            Err(err) => {
                error!("Fatal error in RPC listener: {err}");
                return;
            }
        };
        let server = server.clone();
        tokio::task::spawn(async move {
            let _ = hyper_util::server::conn::auto::Builder::new(
                TokioExecutor::new(),
            )
            .serve_connection(
                TokioIo::new(stream),
                service_fn(move |req| {
                    let server = server.clone();
                    async move { server.process_request(req).await }
                }),
            )
            .await;
        });
    }
}

/// Checks that we can write to the data directory.
fn test_data_dir(dir: &Path) -> Result<(), Error> {
    file::create_dir_all(dir)?;
    let test_file = dir.join("test");
    file::save(b"test", &test_file).map_err(|err| {
        Error::storage(format!(
            "Cannot write to data dir '{}': {err}", dir.display()
        ))
    })?;
    file::delete_file(&test_file).map_err(|err| {
        Error::storage(format!(
            "Cannot delete test file '{}': {err}", test_file.display()
        ))
    })?;
    Ok(())
}
