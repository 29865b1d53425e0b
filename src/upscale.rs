//! Upscaler adapter: external inference service with a classical fallback.
//!
//! The model itself lives behind [`UpscaleService`]. The adapter owns the
//! timeout: the call runs on a helper thread and the adapter stops waiting
//! after `timeout_ms`, whatever the service does. A late reply is dropped.
//!
//! When the service times out, errors, or sends back something that isn't an
//! image of the expected size, the adapter either interpolates with a
//! bicubic (Catmull-Rom) filter and tags the result `degraded`, or, with
//! fallback disabled, reports [`ProcessingError::UpscaleServiceUnavailable`]
//! so the worker can retry. This is the only place an algorithm is
//! substituted without the caller asking.
//!
//! The target size is checked against the pixel limit before the service is
//! called or anything is interpolated.

use crate::error::ProcessingError;
use crate::imaging::calculations::scaled_dimensions;
use crate::imaging::codec::{
    EncodedImage, LimitSettings, RasterImage, decode_within, encode, output_format_for,
};
use crate::imaging::Quality;
use crate::types::Dimensions;
use image::imageops::FilterType;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Scale factors the model is trained for.
pub const SUPPORTED_FACTORS: [u32; 2] = [2, 4];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("bad response: {0}")]
    BadResponse(String),
}

/// Request/response contract of the inference service.
pub trait UpscaleService: Send + Sync {
    fn upscale(&self, image: &[u8], scale_factor: u32) -> Result<Vec<u8>, ServiceError>;
}

/// `POST {endpoint}?scale=N` with the encoded image as the body; the
/// response body is the upscaled image.
pub struct HttpUpscaleService {
    client: reqwest::blocking::Client,
    endpoint: String,
}

impl HttpUpscaleService {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, ServiceError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

impl UpscaleService for HttpUpscaleService {
    fn upscale(&self, image: &[u8], scale_factor: u32) -> Result<Vec<u8>, ServiceError> {
        let url = format!("{}?scale={scale_factor}", self.endpoint);
        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(image.to_vec())
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    ServiceError::Timeout(Duration::ZERO)
                } else {
                    ServiceError::Unavailable(e.to_string())
                }
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(ServiceError::Unavailable(format!("HTTP {status}")));
        }
        let body = response
            .bytes()
            .map_err(|e| ServiceError::BadResponse(e.to_string()))?;
        Ok(body.to_vec())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpscalerSettings {
    /// Inference endpoint. Without one every upscale uses the fallback.
    pub endpoint: Option<String>,
    pub timeout_ms: u64,
    pub fallback: bool,
}

impl Default for UpscalerSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_ms: 10_000,
            fallback: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpscaleOutput {
    pub image: EncodedImage,
    pub before: Dimensions,
    pub after: Dimensions,
    pub degraded: bool,
}

pub struct Upscaler {
    service: Option<Arc<dyn UpscaleService>>,
    timeout: Duration,
    fallback: bool,
    limits: LimitSettings,
}

impl Upscaler {
    pub fn new(
        service: Option<Arc<dyn UpscaleService>>,
        settings: &UpscalerSettings,
        limits: LimitSettings,
    ) -> Self {
        Self {
            service,
            timeout: Duration::from_millis(settings.timeout_ms),
            fallback: settings.fallback,
            limits,
        }
    }

    pub fn upscale(
        &self,
        source: &EncodedImage,
        scale_factor: u32,
    ) -> Result<UpscaleOutput, ProcessingError> {
        if !SUPPORTED_FACTORS.contains(&scale_factor) {
            return Err(ProcessingError::invalid(format!(
                "scale factor must be 2 or 4, got {scale_factor}"
            )));
        }
        let raster = decode_within(source, &self.limits)?;
        let before = raster.dimensions();
        let (width, height) = scaled_dimensions((before.width, before.height), scale_factor)
            .ok_or_else(|| ProcessingError::invalid("upscaled size overflows"))?;
        self.limits.check(width, height)?;
        let after = Dimensions { width, height };

        let failure = match self.call_service(source, scale_factor) {
            Ok(bytes) => match check_response(bytes, after, &self.limits) {
                Ok(image) => {
                    debug!(scale_factor, "upscaled by inference service");
                    return Ok(UpscaleOutput {
                        image,
                        before,
                        after,
                        degraded: false,
                    });
                }
                Err(e) => e,
            },
            Err(e) => e,
        };

        if !self.fallback {
            return Err(ProcessingError::UpscaleServiceUnavailable(failure.to_string()));
        }
        warn!(source = %source.checksum, error = %failure, "upscaler unavailable, interpolating");
        let scaled = interpolate(&raster, after);
        let image = encode(&scaled, output_format_for(source.format), Quality::default())?;
        Ok(UpscaleOutput {
            image,
            before,
            after,
            degraded: true,
        })
    }

    fn call_service(&self, source: &EncodedImage, scale_factor: u32) -> Result<Vec<u8>, ServiceError> {
        let service = self
            .service
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| ServiceError::Unavailable("no inference endpoint configured".into()))?;

        let (tx, rx) = mpsc::channel();
        let bytes = source.bytes.clone();
        thread::Builder::new()
            .name("upscale-call".into())
            .spawn(move || {
                // The receiver may have given up already; nothing to do then.
                let _ = tx.send(service.upscale(&bytes, scale_factor));
            })
            .map_err(|e| ServiceError::Unavailable(e.to_string()))?;

        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(ServiceError::Timeout(self.timeout)),
            Err(RecvTimeoutError::Disconnected) => {
                Err(ServiceError::Unavailable("service call panicked".into()))
            }
        }
    }
}

fn check_response(
    bytes: Vec<u8>,
    expected: Dimensions,
    limits: &LimitSettings,
) -> Result<EncodedImage, ServiceError> {
    let image = EncodedImage::detect(bytes).map_err(|e| ServiceError::BadResponse(e.to_string()))?;
    let raster = decode_within(&image, limits).map_err(|e| ServiceError::BadResponse(e.to_string()))?;
    if raster.dimensions() != expected {
        return Err(ServiceError::BadResponse(format!(
            "expected {}x{}, got {}x{}",
            expected.width,
            expected.height,
            raster.width(),
            raster.height()
        )));
    }
    Ok(image)
}

/// Bicubic resize to `size`.
pub fn interpolate(raster: &RasterImage, size: Dimensions) -> RasterImage {
    RasterImage::new(
        raster
            .pixels()
            .resize_exact(size.width, size.height, FilterType::CatmullRom),
    )
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use crate::imaging::codec::decode;
    use std::sync::Mutex;

    /// Scripted service. Records every call; uses Mutex so it is Sync.
    pub struct MockService {
        pub behavior: Behavior,
        pub calls: Mutex<Vec<u32>>,
    }

    pub enum Behavior {
        /// Return a correctly sized interpolation, as a model would.
        Echo,
        Fail,
        Sleep(Duration),
        Garbage,
    }

    impl MockService {
        pub fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                calls: Mutex::new(Vec::new()),
            })
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl UpscaleService for MockService {
        fn upscale(&self, image: &[u8], scale_factor: u32) -> Result<Vec<u8>, ServiceError> {
            self.calls.lock().unwrap().push(scale_factor);
            match &self.behavior {
                Behavior::Echo => {
                    let source = EncodedImage::detect(image.to_vec()).unwrap();
                    let raster = decode(&source).unwrap();
                    let size = Dimensions {
                        width: raster.width() * scale_factor,
                        height: raster.height() * scale_factor,
                    };
                    let out = encode(&interpolate(&raster, size), source.format, Quality::MAX).unwrap();
                    Ok(out.bytes)
                }
                Behavior::Fail => Err(ServiceError::Unavailable("model offline".into())),
                Behavior::Sleep(d) => {
                    thread::sleep(*d);
                    Err(ServiceError::Unavailable("too late".into()))
                }
                Behavior::Garbage => Ok(b"not an image".to_vec()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{Behavior, MockService};
    use super::*;
    use crate::imaging::codec::decode;
    use crate::test_helpers::{busy_rgba, encode_png};

    fn settings(timeout_ms: u64, fallback: bool) -> UpscalerSettings {
        UpscalerSettings {
            endpoint: None,
            timeout_ms,
            fallback,
        }
    }

    fn upscaler(behavior: Behavior, timeout_ms: u64, fallback: bool) -> (Upscaler, Arc<MockService>) {
        let service = MockService::new(behavior);
        let dyn_service: Arc<dyn UpscaleService> = service.clone();
        let up = Upscaler::new(
            Some(dyn_service),
            &settings(timeout_ms, fallback),
            LimitSettings::default(),
        );
        (up, service)
    }

    #[test]
    fn service_result_is_not_degraded() {
        let (up, service) = upscaler(Behavior::Echo, 5_000, true);
        let out = up.upscale(&encode_png(&busy_rgba(8, 6)), 2).unwrap();
        assert!(!out.degraded);
        assert_eq!(out.after, Dimensions { width: 16, height: 12 });
        assert_eq!(service.call_count(), 1);
    }

    #[test]
    fn timeout_falls_back_to_interpolation() {
        let (up, _) = upscaler(Behavior::Sleep(Duration::from_millis(500)), 20, true);
        let out = up.upscale(&encode_png(&busy_rgba(10, 5)), 2).unwrap();
        assert!(out.degraded);
        let raster = decode(&out.image).unwrap();
        assert_eq!(raster.dimensions(), Dimensions { width: 20, height: 10 });
    }

    #[test]
    fn service_error_falls_back() {
        let (up, _) = upscaler(Behavior::Fail, 1_000, true);
        let out = up.upscale(&encode_png(&busy_rgba(4, 4)), 4).unwrap();
        assert!(out.degraded);
        assert_eq!(out.after, Dimensions { width: 16, height: 16 });
    }

    #[test]
    fn undecodable_response_falls_back() {
        let (up, _) = upscaler(Behavior::Garbage, 1_000, true);
        assert!(up.upscale(&encode_png(&busy_rgba(4, 4)), 2).unwrap().degraded);
    }

    #[test]
    fn fallback_disabled_reports_unavailable() {
        let (up, _) = upscaler(Behavior::Fail, 1_000, false);
        let err = up.upscale(&encode_png(&busy_rgba(4, 4)), 2).unwrap_err();
        assert!(matches!(err, ProcessingError::UpscaleServiceUnavailable(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn no_service_uses_fallback() {
        let up = Upscaler::new(None, &UpscalerSettings::default(), LimitSettings::default());
        let out = up.upscale(&encode_png(&busy_rgba(3, 3)), 2).unwrap();
        assert!(out.degraded);
    }

    #[test]
    fn target_beyond_pixel_limit_is_refused_before_the_service() {
        let service = MockService::new(Behavior::Echo);
        let dyn_service: Arc<dyn UpscaleService> = service.clone();
        // 10x10 decodes fine; 40x40 after x4 does not fit.
        let limits = LimitSettings {
            max_output_pixels: 1_000,
        };
        let up = Upscaler::new(Some(dyn_service), &settings(1_000, true), limits);
        let err = up.upscale(&encode_png(&busy_rgba(10, 10)), 4).unwrap_err();
        assert!(matches!(err, ProcessingError::InvalidInput(_)), "{err:?}");
        assert_eq!(service.call_count(), 0);

        let out = up.upscale(&encode_png(&busy_rgba(10, 10)), 2).unwrap();
        assert_eq!(out.after, Dimensions { width: 20, height: 20 });
    }

    #[test]
    fn unsupported_factor_is_invalid() {
        let (up, service) = upscaler(Behavior::Echo, 1_000, true);
        let err = up.upscale(&encode_png(&busy_rgba(3, 3)), 3).unwrap_err();
        assert!(matches!(err, ProcessingError::InvalidInput(_)));
        assert_eq!(service.call_count(), 0);
    }
}
