//! ImageMagick-backed image processing plugin.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use process_utils::{command, run_with_timeout};

use crate::error::{Error, Result};
use crate::jobs::{ImageFilter, JobParams, JobType};
use crate::plugin::{Plugin, PluginDescriptor, ProcessRequest, ProgressSink};

/// Image processing plugin driving the ImageMagick CLI.
pub struct ImageMagickPlugin {
    descriptor: PluginDescriptor,
    magick_path: String,
    tool_timeout: Duration,
    active: DashMap<String, CancellationToken>,
}

impl ImageMagickPlugin {
    pub fn new(magick_path: String, tool_timeout: Duration) -> Self {
        Self {
            descriptor: PluginDescriptor {
                id: "imagemagick".to_string(),
                name: "ImageMagick Processor".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                author: "aircast".to_string(),
                job_types: vec![JobType::ImageProcess],
                capability_tags: vec![],
                input_formats: vec![
                    "png".into(),
                    "jpg".into(),
                    "jpeg".into(),
                    "gif".into(),
                    "webp".into(),
                    "tiff".into(),
                    "bmp".into(),
                ],
                output_formats: vec![
                    "png".into(),
                    "jpg".into(),
                    "jpeg".into(),
                    "webp".into(),
                    "gif".into(),
                ],
                builtin: true,
            },
            magick_path,
            tool_timeout,
            active: DashMap::new(),
        }
    }
}

/// ImageMagick argv for an image-process request. Filters apply in request
/// order; the resize implied by width/height runs first unless the filter
/// list places `resize` explicitly.
fn magick_args(params: &JobParams) -> Option<Vec<String>> {
    let JobParams::ImageProcess {
        input,
        output,
        width,
        height,
        preserve_aspect,
        filters,
        quality,
        format,
    } = params
    else {
        return None;
    };

    let mut args: Vec<String> = vec![input.clone()];

    let geometry = if *preserve_aspect {
        format!("{width}x{height}")
    } else {
        format!("{width}x{height}!")
    };

    let mut resized = false;
    let push_resize = |args: &mut Vec<String>| {
        args.extend(["-resize".to_string(), geometry.clone()]);
    };

    for filter in filters {
        match filter {
            ImageFilter::Resize => {
                push_resize(&mut args);
                resized = true;
            }
            ImageFilter::Blur => args.extend(["-blur".into(), "0x2".into()]),
            ImageFilter::Sharpen => args.extend(["-sharpen".into(), "0x1".into()]),
            ImageFilter::Grayscale => args.extend(["-colorspace".into(), "Gray".into()]),
            ImageFilter::Normalize => args.push("-normalize".into()),
            ImageFilter::Flip => args.push("-flip".into()),
            ImageFilter::Flop => args.push("-flop".into()),
        }
    }
    if !resized {
        push_resize(&mut args);
    }

    args.extend(["-quality".into(), quality.to_string()]);
    args.push(format!("{format}:{output}"));
    Some(args)
}

#[async_trait]
impl Plugin for ImageMagickPlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    async fn initialize(&self, _config_path: &Path) -> Result<()> {
        if !super::probe_tool(&self.magick_path, "-version").await {
            return Err(Error::plugin(format!(
                "imagemagick binary '{}' is not runnable",
                self.magick_path
            )));
        }
        Ok(())
    }

    async fn shutdown(&self) {
        for entry in self.active.iter() {
            entry.value().cancel();
        }
        self.active.clear();
    }

    async fn is_healthy(&self) -> bool {
        super::probe_tool(&self.magick_path, "-version").await
    }

    fn can_handle(&self, params: &JobParams) -> bool {
        match params {
            JobParams::ImageProcess { format, .. } => self
                .descriptor
                .output_formats
                .iter()
                .any(|f| f == &format.to_ascii_lowercase()),
            _ => false,
        }
    }

    async fn process(&self, request: &ProcessRequest, sink: &ProgressSink) -> Result<String> {
        let args = magick_args(&request.params)
            .ok_or_else(|| Error::plugin("imagemagick plugin received a non-image request"))?;
        let output = request
            .params
            .output()
            .ok_or_else(|| Error::internal("image request without output"))?
            .to_string();

        let cancel = CancellationToken::new();
        self.active.insert(request.job_id.clone(), cancel.clone());
        sink.report(10, "processing");

        let mut cmd = command(&self.magick_path);
        cmd.args(&args);
        let result = run_with_timeout(cmd, self.tool_timeout, &cancel).await;

        self.active.remove(&request.job_id);

        match result {
            Ok(_) => {
                sink.report(100, "done");
                Ok(output)
            }
            Err(e) => {
                warn!(job = %request.job_id, "imagemagick failed: {}", e);
                Err(e.into())
            }
        }
    }

    async fn cancel(&self, job_id: &str) -> Result<()> {
        match self.active.get(job_id) {
            Some(token) => {
                debug!(job = %job_id, "cancelling active imagemagick job");
                token.cancel();
                Ok(())
            }
            None => Err(Error::not_found("active job", job_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(preserve: bool, filters: Vec<ImageFilter>) -> JobParams {
        JobParams::ImageProcess {
            input: "/in/a.png".to_string(),
            output: "/out/a.jpg".to_string(),
            width: 256,
            height: 256,
            preserve_aspect: preserve,
            filters,
            quality: 85,
            format: "jpg".to_string(),
        }
    }

    #[test]
    fn resize_is_implied_by_dimensions() {
        let args = magick_args(&params(true, vec![])).unwrap();
        let joined = args.join(" ");
        assert!(joined.contains("-resize 256x256"));
        assert!(!joined.contains("256x256!"));
        assert!(joined.ends_with("jpg:/out/a.jpg"));
    }

    #[test]
    fn exact_geometry_when_aspect_not_preserved() {
        let args = magick_args(&params(false, vec![ImageFilter::Resize])).unwrap();
        assert!(args.join(" ").contains("-resize 256x256!"));
    }

    #[test]
    fn filters_apply_in_request_order() {
        let args = magick_args(&params(
            true,
            vec![ImageFilter::Grayscale, ImageFilter::Resize, ImageFilter::Flip],
        ))
        .unwrap();
        let joined = args.join(" ");
        let gray = joined.find("-colorspace Gray").unwrap();
        let resize = joined.find("-resize").unwrap();
        let flip = joined.find("-flip").unwrap();
        assert!(gray < resize && resize < flip);
    }

    #[test]
    fn quality_and_format_prefix() {
        let args = magick_args(&params(true, vec![])).unwrap();
        let joined = args.join(" ");
        assert!(joined.contains("-quality 85"));
        assert!(joined.ends_with("jpg:/out/a.jpg"));
    }

    #[test]
    fn declines_unsupported_output_format() {
        let plugin = ImageMagickPlugin::new("magick".to_string(), Duration::from_secs(60));
        let p = JobParams::ImageProcess {
            input: "/in/a.png".to_string(),
            output: "/out/a.xcf".to_string(),
            width: 10,
            height: 10,
            preserve_aspect: true,
            filters: vec![],
            quality: 85,
            format: "xcf".to_string(),
        };
        assert!(!plugin.can_handle(&p));
        assert!(plugin.can_handle(&params(true, vec![])));
    }
}
