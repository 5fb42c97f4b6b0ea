//! This module contains the flagcast web services implementation
//!
//! Both transport surfaces are mounted on one actix-web server: the
//! WebSocket streaming endpoint, the single-shot JSON polling endpoint and
//! batched stats admission. They share the delta assembler, so a polling
//! client and a streaming client observe identical payloads.

use crate::deltas::DeltaAssembler;
use crate::stats::StatsService;
use actix_web::{dev::ServerHandle, web, App, HttpServer};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

mod rpc;
mod ws;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("failed to bind service endpoint: {0}")]
    Bind(String),
    #[error("service runtime failure: {0}")]
    Runtime(String),
}

pub struct ServicesBuilder {
    prefix: String,
    port: u16,
    bind: String,
    assembler: Arc<DeltaAssembler>,
    stats: Arc<StatsService>,
}

impl ServicesBuilder {
    pub fn new(assembler: Arc<DeltaAssembler>, stats: Arc<StatsService>) -> Self {
        Self {
            prefix: "v1".to_owned(),
            port: 4242,
            bind: "0.0.0.0".to_owned(),
            assembler,
            stats,
        }
    }

    pub fn prefix(mut self, v: &str) -> Self {
        self.prefix = v.to_owned();
        self
    }

    pub fn bind(mut self, v: &str) -> Self {
        self.bind = v.to_owned();
        self
    }

    pub fn port(mut self, v: u16) -> Self {
        self.port = v;
        self
    }

    pub fn run(self) -> Result<(ServerHandle, JoinHandle<Result<(), ServiceError>>), ServiceError> {
        let ws_data = web::Data::new(ws::WsData::new(self.assembler.clone(), self.stats.clone()));
        let rpc_data = web::Data::new(rpc::RpcHandler::new(self.assembler, self.stats));
        let prefix = self.prefix;
        let server = HttpServer::new(move || {
            App::new()
                .app_data(rpc_data.clone())
                .service(
                    web::resource(format!("/{}/updates", prefix))
                        .route(web::post().to(rpc::updates)),
                )
                .service(
                    web::resource(format!("/{}/stats", prefix)).route(web::post().to(rpc::stats)),
                )
                .app_data(ws_data.clone())
                .service(
                    web::resource(format!("/{}/ws", prefix)).route(web::get().to(ws::subscribe)),
                )
        })
        .bind((self.bind, self.port))
        .map_err(|err| ServiceError::Bind(err.to_string()))?
        .run();
        let handle = server.handle();
        let server = async move {
            let res = server.await;
            res.map_err(|err| ServiceError::Runtime(err.to_string()))
        };
        let task = tokio::spawn(server);
        Ok((handle, task))
    }
}
