/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Error kinds surfaced by the CRI services and their gRPC mapping.

use crate::cni::CniError;
use crate::config::ConfigError;
use crate::engine::EngineError;
use crate::image::ImageError;
use crate::netns::NetNsError;
use crate::oci::OciError;
use crate::registrar::RegistrarError;
use crate::store::StoreError;
use crate::streaming::StreamingError;
use thiserror::Error;
use tonic::Status;
use tracing::error;

pub type Result<T> = std::result::Result<T, CriError>;

#[derive(Debug, Error)]
pub enum CriError {
    #[error("server is not initialized yet")]
    NotInitialized,
    #[error("{reason}")]
    InvalidArgument { reason: String },
    #[error("{reason}")]
    FailedPrecondition { reason: String },
    #[error("{reason}")]
    DeadlineExceeded { reason: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Registrar(#[from] RegistrarError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Cni(#[from] CniError),
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error(transparent)]
    Oci(#[from] OciError),
    #[error(transparent)]
    NetNs(#[from] NetNsError),
    #[error(transparent)]
    Streaming(#[from] StreamingError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{context}: {source}")]
    Io { context: String, source: std::io::Error },
    #[error("{message}")]
    Internal { message: String },
}

impl CriError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        CriError::InvalidArgument { reason: reason.into() }
    }

    pub(crate) fn precondition(reason: impl Into<String>) -> Self {
        CriError::FailedPrecondition { reason: reason.into() }
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        CriError::Internal { message: message.into() }
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        CriError::Io { context: context.into(), source }
    }
}

impl From<CriError> for Status {
    fn from(err: CriError) -> Self {
        let msg = err.to_string();
        error!("{msg}");
        match err {
            CriError::NotInitialized => Status::unavailable(msg),
            CriError::InvalidArgument { .. } => Status::invalid_argument(msg),
            CriError::FailedPrecondition { .. } => {
                Status::failed_precondition(msg)
            }
            CriError::DeadlineExceeded { .. } => {
                Status::deadline_exceeded(msg)
            }
            CriError::Store(e) => match e {
                StoreError::SandboxNotFound { .. }
                | StoreError::ContainerNotFound { .. }
                | StoreError::ImageNotFound { .. } => Status::not_found(msg),
                StoreError::SandboxExists { .. }
                | StoreError::ContainerExists { .. } => {
                    Status::already_exists(msg)
                }
                StoreError::ImageLeased { .. }
                | StoreError::ImageNotLeasable { .. } => {
                    Status::failed_precondition(msg)
                }
                StoreError::ImageNotLeased { .. } => Status::internal(msg),
            },
            CriError::Registrar(_) => Status::already_exists(msg),
            CriError::Engine(e) => match e {
                EngineError::NotFound { .. } => Status::not_found(msg),
                EngineError::AlreadyExists { .. } => {
                    Status::already_exists(msg)
                }
                EngineError::Unavailable { .. } => Status::unavailable(msg),
                EngineError::Rejected { .. } => {
                    Status::failed_precondition(msg)
                }
                EngineError::Failed { .. } | EngineError::Malformed { .. } => {
                    Status::internal(msg)
                }
            },
            CriError::Cni(e) => match e {
                CniError::NotReady => Status::failed_precondition(msg),
                _ => Status::internal(msg),
            },
            CriError::Image(e) => match e {
                ImageError::BadReference { .. } => {
                    Status::invalid_argument(msg)
                }
                ImageError::Malformed { .. } => Status::internal(msg),
            },
            CriError::Oci(e) => match e {
                OciError::EmptyEntrypoint
                | OciError::EmptyProcessArgs
                | OciError::BadApparmorProfile { .. }
                | OciError::UnknownCapability { .. }
                | OciError::BadDevice { .. } => Status::invalid_argument(msg),
                OciError::Spec(_) => Status::internal(msg),
            },
            CriError::Streaming(e) => match e {
                StreamingError::SessionNotFound { .. } => {
                    Status::not_found(msg)
                }
                StreamingError::Timeout { .. } => {
                    Status::deadline_exceeded(msg)
                }
                _ => Status::internal(msg),
            },
            CriError::NetNs(_)
            | CriError::Config(_)
            | CriError::Io { .. }
            | CriError::Internal { .. } => Status::internal(msg),
        }
    }
}
