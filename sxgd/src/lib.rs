// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

/*!
# sxgd

sxgd produces and serves [Signed HTTP Exchanges][sxg] (SXG): bundles that
bind a request URL to a specific HTTP response under the publisher's
signature, so a distributor can deliver the content from its own servers
while the browser attributes it to the publisher's origin.

## Components

The packager pipeline fetches an upstream resource, runs processors over it
(preverification, header scrubbing, preload discovery in HTML), computes
the validity window and validity URL, and asks the exchange factory to sign
it. Artifacts are memoized in a single-flight resource cache and may be
materialized to disk.

The certificate manager loads the publisher's chain, augments it with an
OCSP staple and SCT list, and persists each augmented chain under its
digest. The serving handler exposes the doc endpoint that produces
exchanges, the cert endpoint resolving chains by digest, the stub validity
endpoint, and a health check.

[sxg]: https://wicg.github.io/webpackage/draft-yasskin-http-origin-signed-responses.html
*/

pub mod cache;
pub mod certchain;
pub mod config;
pub mod error;
pub mod exchange;
pub mod fetch;
pub mod packager;
pub mod processor;
pub mod resource;
pub mod rewrite;
pub mod server;
pub mod validity;

use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

/// Install and manage signal handlers for the process.
///
/// # SIGTERM and SIGINT
///
/// Sending SIGTERM or SIGINT to the process will cause it to stop accepting
/// new connections. In-flight requests are allowed to complete before the
/// process shuts down.
#[doc(hidden)]
pub async fn signal_handler(halt_token: CancellationToken) -> Result<(), anyhow::Error> {
    let mut sigterm_stream = signal(SignalKind::terminate()).inspect_err(|error| {
        tracing::error!(?error, "Failed to register a SIGTERM signal handler");
    })?;
    let mut sigint_stream = signal(SignalKind::interrupt()).inspect_err(|error| {
        tracing::error!(?error, "Failed to register a SIGINT signal handler");
    })?;

    loop {
        tokio::select! {
            _ = sigterm_stream.recv() => {
                tracing::info!("SIGTERM received, beginning service shutdown");
                halt_token.cancel();
            }
            _ = sigint_stream.recv() => {
                tracing::info!("SIGINT received, beginning service shutdown");
                halt_token.cancel();
            }
        }
    }
}
