//! pandoc-backed document conversion plugin.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use process_utils::{command, run_with_timeout};

use crate::error::{Error, Result};
use crate::jobs::{JobParams, JobType};
use crate::plugin::{Plugin, PluginDescriptor, ProcessRequest, ProgressSink};

/// Document conversion plugin driving the pandoc CLI.
pub struct PandocPlugin {
    descriptor: PluginDescriptor,
    pandoc_path: String,
    tool_timeout: Duration,
    active: DashMap<String, CancellationToken>,
}

impl PandocPlugin {
    pub fn new(pandoc_path: String, tool_timeout: Duration) -> Self {
        Self {
            descriptor: PluginDescriptor {
                id: "pandoc".to_string(),
                name: "Pandoc Converter".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                author: "aircast".to_string(),
                job_types: vec![JobType::DocumentConvert],
                capability_tags: vec![],
                input_formats: vec![
                    "md".into(),
                    "markdown".into(),
                    "html".into(),
                    "docx".into(),
                    "odt".into(),
                    "rst".into(),
                    "latex".into(),
                ],
                output_formats: vec![
                    "pdf".into(),
                    "html".into(),
                    "docx".into(),
                    "odt".into(),
                    "epub".into(),
                    "markdown".into(),
                ],
                builtin: true,
            },
            pandoc_path,
            tool_timeout,
            active: DashMap::new(),
        }
    }
}

/// pandoc argv for a document-convert request.
fn pandoc_args(params: &JobParams) -> Option<Vec<String>> {
    let JobParams::DocumentConvert {
        input,
        output,
        format,
        template,
        variables,
    } = params
    else {
        return None;
    };

    let mut args: Vec<String> = vec![input.clone(), "-o".into(), output.clone()];
    args.extend(["-t".into(), format.clone()]);
    if let Some(template) = template {
        args.extend(["--template".into(), template.clone()]);
    }
    // Deterministic order for testability and reproducible invocations.
    let mut vars: Vec<_> = variables.iter().collect();
    vars.sort_by_key(|(k, _)| k.clone());
    for (key, value) in vars {
        args.extend(["-V".into(), format!("{key}={value}")]);
    }
    Some(args)
}

#[async_trait]
impl Plugin for PandocPlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    async fn initialize(&self, _config_path: &Path) -> Result<()> {
        if !super::probe_tool(&self.pandoc_path, "--version").await {
            return Err(Error::plugin(format!(
                "pandoc binary '{}' is not runnable",
                self.pandoc_path
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
        super::probe_tool(&self.pandoc_path, "--version").await
    }

    fn can_handle(&self, params: &JobParams) -> bool {
        match params {
            JobParams::DocumentConvert { format, .. } => self
                .descriptor
                .output_formats
                .iter()
                .any(|f| f == &format.to_ascii_lowercase()),
            _ => false,
        }
    }

    async fn process(&self, request: &ProcessRequest, sink: &ProgressSink) -> Result<String> {
        let args = pandoc_args(&request.params)
            .ok_or_else(|| Error::plugin("pandoc plugin received a non-document request"))?;
        let output = request
            .params
            .output()
            .ok_or_else(|| Error::internal("document request without output"))?
            .to_string();

        let cancel = CancellationToken::new();
        self.active.insert(request.job_id.clone(), cancel.clone());
        sink.report(10, "converting");

        let mut cmd = command(&self.pandoc_path);
        cmd.args(&args);
        let result = run_with_timeout(cmd, self.tool_timeout, &cancel).await;

        self.active.remove(&request.job_id);

        match result {
            Ok(_) => {
                sink.report(100, "done");
                Ok(output)
            }
            Err(e) => {
                warn!(job = %request.job_id, "pandoc failed: {}", e);
                Err(e.into())
            }
        }
    }

    async fn cancel(&self, job_id: &str) -> Result<()> {
        match self.active.get(job_id) {
            Some(token) => {
                debug!(job = %job_id, "cancelling active pandoc job");
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
    use std::collections::HashMap;

    #[test]
    fn command_includes_template_and_sorted_variables() {
        let params = JobParams::DocumentConvert {
            input: "/in/report.md".to_string(),
            output: "/out/report.pdf".to_string(),
            format: "pdf".to_string(),
            template: Some("/tpl/corp.latex".to_string()),
            variables: HashMap::from([
                ("title".to_string(), "Q3".to_string()),
                ("author".to_string(), "ops".to_string()),
            ]),
        };
        let args = pandoc_args(&params).unwrap();
        let joined = args.join(" ");
        assert!(joined.starts_with("/in/report.md -o /out/report.pdf -t pdf"));
        assert!(joined.contains("--template /tpl/corp.latex"));
        let author = joined.find("-V author=ops").unwrap();
        let title = joined.find("-V title=Q3").unwrap();
        assert!(author < title);
    }

    #[test]
    fn declines_unsupported_format() {
        let plugin = PandocPlugin::new("pandoc".to_string(), Duration::from_secs(60));
        let params = JobParams::DocumentConvert {
            input: "/in/a.md".to_string(),
            output: "/out/a.xyz".to_string(),
            format: "xyz".to_string(),
            template: None,
            variables: HashMap::new(),
        };
        assert!(!plugin.can_handle(&params));
    }
}
