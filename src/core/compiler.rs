use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use tokio::fs;

use crate::core::{
    domain::{ContainerType, ProcessResult, ProgrammingLanguage},
    limits::LimitPolicy,
    traits::{
        compiler::{BuildOutput, CompileError, Compiler},
        runner::Runner,
        sandbox::LaunchSpec,
    },
};

/// Builds sources with the language's build command inside the sandbox.
#[derive(Debug, Clone)]
pub struct SandboxCompiler {
    runner: Arc<dyn Runner>,
    policy: LimitPolicy,
}

impl SandboxCompiler {
    pub fn new(runner: Arc<dyn Runner>, policy: LimitPolicy) -> Self {
        Self { runner, policy }
    }
}

#[async_trait]
impl Compiler for SandboxCompiler {
    #[tracing::instrument(skip(self, source, language), fields(language = %language.id))]
    async fn compile(
        &self,
        source: &str,
        language: &ProgrammingLanguage,
        dest: &Path,
        container_type: ContainerType,
    ) -> Result<BuildOutput, CompileError> {
        fs::create_dir_all(dest)
            .await
            .map_err(|e| CompileError::Internal { msg: e.to_string() })?;
        fs::write(dest.join(&language.source_file), source)
            .await
            .map_err(|e| CompileError::Internal { msg: e.to_string() })?;

        let Some(build) = &language.build else {
            return Ok(BuildOutput { log: String::new() });
        };

        let spec = LaunchSpec::new(
            &language.image,
            container_type,
            dest,
            build.clone(),
            self.policy.build_ceilings(),
        );
        let result = self
            .runner
            .run(&spec, "")
            .await
            .map_err(|e| CompileError::Internal { msg: e.to_string() })?;
        let log = build_log(&result);
        tracing::debug!(exit_code = result.exit_code, "build finished");

        result
            .into_result()
            .map_err(|failed| CompileError::CompilationFailed {
                result: failed.result,
            })?;
        Ok(BuildOutput { log })
    }
}

/// Compiler diagnostics, whichever stream they went to.
pub fn build_log(result: &ProcessResult) -> String {
    let mut log = String::new();
    for stream in [&result.stdout, &result.stderr] {
        if !stream.trim().is_empty() {
            log.push_str(stream);
            if !stream.ends_with('\n') {
                log.push('\n');
            }
        }
    }
    if result.timed_out {
        log.push_str("build exceeded its time limit\n");
    }
    log
}
