/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! gRPC image service.

use super::CriService;
use proto::cri::image_service_server;
use proto::cri::{
    ImageFsInfoRequest, ImageFsInfoResponse, ImageStatusRequest,
    ImageStatusResponse, ListImagesRequest, ListImagesResponse,
    PullImageRequest, PullImageResponse, RemoveImageRequest,
    RemoveImageResponse,
};
use std::collections::HashMap;
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{info, trace};

#[derive(Clone)]
pub struct ImageService {
    service: Arc<CriService>,
}

impl ImageService {
    pub fn new(service: Arc<CriService>) -> Self {
        Self { service }
    }
}

#[tonic::async_trait]
impl image_service_server::ImageService for ImageService {
    async fn list_images(
        &self,
        request: Request<ListImagesRequest>,
    ) -> Result<Response<ListImagesResponse>, Status> {
        self.service.require_initialized()?;
        let r = request.into_inner();
        trace!("ListImages with {:?}", r.filter);
        let images = self
            .service
            .list_images(r.filter.as_ref().and_then(|f| f.image.as_ref()));
        Ok(Response::new(ListImagesResponse { images }))
    }

    async fn image_status(
        &self,
        request: Request<ImageStatusRequest>,
    ) -> Result<Response<ImageStatusResponse>, Status> {
        self.service.require_initialized()?;
        let r = request.into_inner();
        let reference = r
            .image
            .as_ref()
            .map(|spec| spec.image.as_str())
            .unwrap_or_default();
        trace!("ImageStatus for '{reference}'");
        // An absent image is an empty response, not an error.
        let image = self.service.image_status(reference);
        Ok(Response::new(ImageStatusResponse {
            image,
            info: HashMap::new(),
        }))
    }

    async fn pull_image(
        &self,
        request: Request<PullImageRequest>,
    ) -> Result<Response<PullImageResponse>, Status> {
        self.service.require_initialized()?;
        let r = request.into_inner();
        let reference = r
            .image
            .as_ref()
            .map(|spec| spec.image.as_str())
            .unwrap_or_default();
        info!("PullImage '{reference}'");
        let image_ref = self.service.pull_image(reference).await?;
        trace!("PullImage '{reference}' returns '{image_ref}'");
        Ok(Response::new(PullImageResponse { image_ref }))
    }

    async fn remove_image(
        &self,
        request: Request<RemoveImageRequest>,
    ) -> Result<Response<RemoveImageResponse>, Status> {
        self.service.require_initialized()?;
        let r = request.into_inner();
        let reference = r
            .image
            .as_ref()
            .map(|spec| spec.image.as_str())
            .unwrap_or_default();
        info!("RemoveImage '{reference}'");
        self.service.remove_image(reference).await?;
        trace!("RemoveImage '{reference}' returns");
        Ok(Response::new(RemoveImageResponse {}))
    }

    async fn image_fs_info(
        &self,
        _request: Request<ImageFsInfoRequest>,
    ) -> Result<Response<ImageFsInfoResponse>, Status> {
        self.service.require_initialized()?;
        trace!("ImageFsInfo");
        let usage = self.service.image_fs_info();
        Ok(Response::new(ImageFsInfoResponse {
            image_filesystems: vec![usage],
        }))
    }
}
