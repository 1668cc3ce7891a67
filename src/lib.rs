/*
 * This file is part of kube-oidc-proxy.
 *
 * kube-oidc-proxy is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * kube-oidc-proxy is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with kube-oidc-proxy.  If not, see <https://www.gnu.org/licenses/>.
 */

#![forbid(unsafe_code)]

pub mod audit;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod impersonation;
pub mod oidc;
pub mod pipeline;
pub mod roundtrip;
pub mod sar;
pub mod tokenreview;
pub mod transport;
pub mod websocket;

use std::sync::Arc;

use anyhow::Context;
use axum::Router;

use crate::cli::Cli;
use crate::config::AppConfig;
use crate::pipeline::AppState;

pub fn init_subscriber() {
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(tracing::Level::INFO)
            .finish(),
    )
    .expect("setting default subscriber failed");
}

/// Builds the fully wired `AppState` and router from a parsed CLI. Split
/// out from `main` so integration tests can drive the router directly
/// without a real listener.
pub async fn build_app(cli: Cli) -> anyhow::Result<(Arc<AppState>, Router)> {
    let config = AppConfig::from_cli(cli).context("resolving configuration")?;
    let transports = crate::transport::build(config.upstream()).context("building upstream transports")?;
    let state = AppState::new(config, transports).context("building app state")?;
    let router = pipeline::build_router(state.clone());
    Ok((state, router))
}
