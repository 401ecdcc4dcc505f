use serde::{Deserialize, Serialize};

/// One step of the fix/format/lint pipeline.
///
/// `retry_once` reruns the command a single time when it fails — some
/// formatters exit non-zero on the pass that actually rewrites files and
/// succeed on the second run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineStep {
    pub name: String,
    pub command: String,
    pub retry_once: bool,
}

impl PipelineStep {
    pub fn new(name: &str, command: &str) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            retry_once: false,
        }
    }

    pub fn retry_once(mut self) -> Self {
        self.retry_once = true;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Pipeline steps, run in order with chain (`&&`/`||`) semantics.
    pub steps: Vec<PipelineStep>,
    /// Image used for the Dockerized Prettier step.
    pub prettier_image: String,
    /// Container-side path the project root is mounted at for Prettier.
    pub prettier_mount: String,
    /// Directory of per-image build definitions, relative to the project
    /// root. Each subdirectory carries an `image_info.json`.
    pub ci_images_dir: String,
    /// CI entry script, relative to the project root.
    pub ci_script: String,
    /// Directory inside the CI container where the repo clone (and its
    /// `reports_*.tar.gz` output) lives.
    pub ci_clone_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            steps: vec![
                PipelineStep::new(
                    "fix",
                    "ruff check . --select UP,I,F,A,B,C4,ERA,PIE,SIM,RET,TRY,PL \
                     --fix-only --quiet --exit-zero",
                ),
                PipelineStep::new("docstring-format", "docformatter src").retry_once(),
                PipelineStep::new("format", "ruff format ."),
                PipelineStep::new("prettier", "devharness prettify"),
                PipelineStep::new("lint", "ruff check ."),
                PipelineStep::new("docstring-lint", "pydoclint src"),
                PipelineStep::new("typecheck", "mypy ."),
            ],
            prettier_image: "python-dev-loaded".to_string(),
            prettier_mount: "/home/basicuser/prettier-formatter/git-repo".to_string(),
            ci_images_dir: "test/resources/docker-images".to_string(),
            ci_script: "ci-test".to_string(),
            ci_clone_dir: "/home/dockeruser/ci-workspace".to_string(),
        }
    }
}
