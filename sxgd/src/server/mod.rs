// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The sxgd server: component assembly, the accept loop, and per-connection
//! request handling.

pub mod handler;
pub mod http;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, instrument};
use url::Url;

use crate::cache::{FileWriteConfig, ResourceCache};
use crate::certchain::manager::{CertCache, ChainSource, Manager};
use crate::certchain::ocsp::OcspSource;
use crate::config::Config;
use crate::exchange::factory::ManagedFactoryProvider;
use crate::exchange::Version;
use crate::fetch::{HttpFetcher, RequestTweaker};
use crate::packager::Packager;
use crate::processor::{self, TaskSetConfig};
use crate::rewrite::UrlRule;
use crate::validity::{ValidPeriodRule, ValidityUrlRule};

use handler::Handler;
use http::{HttpResponse, read_request, write_response};

/// A fully assembled server, ready to run.
pub struct Server {
    config: Arc<Config>,
    listener: TcpListener,
    handler: Arc<Handler>,
    cert_manager: Arc<Manager>,
}

/// A running server; dropping the handle does not stop it.
pub struct Listener {
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
    halt_token: CancellationToken,
    local_addr: std::net::SocketAddr,
}

impl Listener {
    /// Stop accepting new connections and wait for in-flight requests.
    pub async fn halt(self) -> anyhow::Result<()> {
        self.halt_token.cancel();
        self.task.await??;
        Ok(())
    }

    /// A token that starts graceful shutdown when cancelled.
    pub fn halt_token(&self) -> CancellationToken {
        self.halt_token.clone()
    }

    pub async fn wait_to_finish(self) -> anyhow::Result<()> {
        self.task.await??;
        Ok(())
    }

    /// The bound address; useful when the configured port was 0.
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }
}

impl Server {
    /// Build every component from the configuration, load the certificate
    /// chain, and bind the listen socket.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        config.validate()?;
        let version = Version::parse(&config.sxg.version)
            .context("version was validated but does not parse")?;

        // Certificate manager.
        let cert = &config.sxg.cert;
        let source = if cert.cert_cbor.is_empty() {
            ChainSource::Pem {
                cert_file: cert.pem_file.clone(),
            }
        } else {
            ChainSource::Cbor {
                path: PathBuf::from(&cert.cert_cbor),
            }
        };
        let ocsp_source = if !cert.ocsp_file.is_empty() {
            OcspSource::File(PathBuf::from(&cert.ocsp_file))
        } else if !cert.ocsp_responder.is_empty() {
            OcspSource::Fetch {
                responder: Some(Url::parse(&cert.ocsp_responder)?),
            }
        } else if cert.allow_test_cert {
            OcspSource::Dummy
        } else {
            OcspSource::Fetch { responder: None }
        };
        let sct_file = (!cert.sct_file.is_empty()).then(|| PathBuf::from(&cert.sct_file));
        let chain_cache = if cert.cache_dir.is_empty() {
            CertCache::Null
        } else {
            CertCache::Disk {
                dir: PathBuf::from(&cert.cache_dir),
            }
        };
        let cert_manager = Arc::new(Manager::new(source, ocsp_source, sct_file, chain_cache)?);
        cert_manager
            .refresh()
            .await
            .context("failed to load the certificate chain")?;

        let key_pem = tokio::fs::read(&cert.key_file)
            .await
            .with_context(|| format!("failed to read private key {:?}", cert.key_file))?;
        let private_key = openssl::pkey::PKey::private_key_from_pem(&key_pem)
            .context("private key does not parse as PEM")?;

        let factory = Arc::new(ManagedFactoryProvider::new(
            cert_manager.clone(),
            version,
            config.sxg.mi_record_size,
            Url::parse(&config.sxg.cert_url)?,
            private_key,
            cert.allow_test_cert,
        ));

        // Packager.
        let request_headers = config.request_header_pairs();
        let request_tweaker = if request_headers.is_empty() {
            RequestTweaker::Default(version)
        } else {
            RequestTweaker::Sequence(vec![
                RequestTweaker::Default(version),
                RequestTweaker::SetHeaders(request_headers),
            ])
        };
        let task_set = TaskSetConfig {
            aggressive: config.sxg.task_set == "aggressive",
            preload_css: config.sxg.preload_css,
            preload_js: config.sxg.preload_js,
        };
        let processor = Arc::new(processor::comprehensive(
            vec![200],
            config.sxg.size_limit,
            task_set,
        ));
        let filewrite = (!config.sxg.sxg_dir.is_empty()).then(|| FileWriteConfig {
            base_dir: PathBuf::from(&config.sxg.sxg_dir),
            extension: config.sxg.sxg_ext.clone(),
        });
        let packager = Arc::new(Packager {
            request_tweaker,
            physical_url_rule: UrlRule::physical(&config.sxg.index_file),
            validity_url_rule: ValidityUrlRule::AppendExtDotLastModified(
                config.sxg.validity_ext.clone(),
            ),
            valid_period_rule: ValidPeriodRule::standard(config.sxg.expiry, config.sxg.js_expiry),
            processor,
            factory,
            cache: Arc::new(ResourceCache::new(filewrite)),
            fetcher: Arc::new(HttpFetcher::new()?),
            fetch_timeout: config.sxg.fetch_timeout,
            max_preload_depth: config.sxg.max_preload_depth,
            max_preloads_per_resource: config.sxg.max_preloads_per_resource,
            keep_non_sxg_preloads: config.sxg.keep_non_sxg_preloads,
        });

        let handler = Arc::new(Handler::new(
            &config.server.doc_path,
            &config.server.sign_param,
            &config.server.cert_path,
            &config.server.validity_path,
            &config.server.health_path,
            packager,
            cert_manager.clone(),
            cert.allow_test_cert,
        ));

        let listener = TcpListener::bind((config.listen.host.as_str(), config.listen.port))
            .await
            .with_context(|| {
                format!(
                    "failed to bind {}:{}",
                    config.listen.host, config.listen.port
                )
            })?;

        Ok(Server {
            config: Arc::new(config),
            listener,
            handler,
            cert_manager,
        })
    }

    /// Run the accept loop until the returned listener is halted.
    #[instrument(skip_all, name = "server")]
    pub fn run(self) -> anyhow::Result<Listener> {
        let halt_token = CancellationToken::new();
        let server_halt_token = halt_token.clone();
        let local_addr = self.listener.local_addr()?;
        tracing::info!(%local_addr, "Listening for requests");

        let refresh = self.cert_manager.spawn_refresh(
            self.config.sxg.cert.refresh_interval,
            halt_token.clone(),
        );

        let task = tokio::spawn(async move {
            let connections = TaskTracker::new();
            loop {
                tokio::select! {
                    _ = server_halt_token.cancelled() => {
                        tracing::info!("Shutdown requested, no new connections will be accepted");
                        break;
                    }
                    accepted = self.listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                let handler = self.handler.clone();
                                connections.spawn(
                                    async move {
                                        if let Err(error) = handle_connection(handler, stream).await {
                                            tracing::debug!(?error, %peer, "Connection ended with error");
                                        }
                                    }
                                    .instrument(tracing::info_span!("conn", %peer)),
                                );
                            }
                            Err(error) => {
                                tracing::error!(?error, "Failed to accept incoming connection");
                            }
                        }
                    }
                }
            }

            connections.close();
            connections.wait().await;
            refresh.await?;
            Ok::<_, anyhow::Error>(())
        });

        Ok(Listener {
            task,
            halt_token,
            local_addr,
        })
    }
}

/// Serve requests off one connection until it closes.
async fn handle_connection(handler: Arc<Handler>, stream: TcpStream) -> anyhow::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        let request = match read_request(&mut reader).await {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(error) => {
                tracing::debug!(?error, "Malformed request");
                let response = HttpResponse::new(400);
                write_response(&mut write_half, &response, true).await?;
                break;
            }
        };

        let close = request.wants_close();
        let response = handler.handle(&request, Utc::now()).await;
        tracing::info!(
            method = %request.method,
            target = %request.target,
            status = response.status,
            "Request handled"
        );
        write_response(&mut write_half, &response, close).await?;
        if close {
            break;
        }
    }

    Ok(())
}
