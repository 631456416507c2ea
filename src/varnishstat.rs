/// varnishstat invocation: build the argument list, run the subprocess with a
/// bounded lifetime, and hand back its raw JSON output.
///
/// The subprocess is spawned with `kill_on_drop`, so a scrape abandoned by a
/// timeout or by an aborted HTTP request takes the child down with it.
use crate::config::VarnishstatConfig;
use crate::exporter::StatsSource;
use crate::version::VarnishVersion;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;

/// Errors produced while running varnishstat.
#[derive(Debug)]
pub enum StatsError {
    /// Failed to spawn the subprocess (binary missing, not executable, ...).
    Spawn {
        program: String,
        source: std::io::Error,
    },
    /// The subprocess did not finish within the configured timeout.
    Timeout { timeout: Duration },
    /// The subprocess exited unsuccessfully. `output` holds stdout followed by stderr.
    Exit { code: Option<i32>, output: Vec<u8> },
    /// Failed to collect the subprocess output.
    Io { source: std::io::Error },
}

impl std::fmt::Display for StatsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatsError::Spawn { program, source } => {
                write!(f, "failed to spawn {program}: {source}")
            }
            StatsError::Timeout { timeout } => {
                write!(f, "varnishstat did not finish within {}s", timeout.as_secs_f64())
            }
            StatsError::Exit { code: Some(code), .. } => {
                write!(f, "varnishstat exited with status {code}")
            }
            StatsError::Exit { code: None, .. } => write!(f, "varnishstat killed by signal"),
            StatsError::Io { source } => write!(f, "I/O error reading varnishstat output: {source}"),
        }
    }
}

impl std::error::Error for StatsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatsError::Spawn { source, .. } => Some(source),
            StatsError::Io { source } => Some(source),
            StatsError::Timeout { .. } | StatsError::Exit { .. } => None,
        }
    }
}

impl StatsError {
    /// Whatever the subprocess printed before failing, for operator diagnosis.
    pub fn diagnostic(&self) -> &[u8] {
        match self {
            StatsError::Exit { output, .. } => output,
            _ => &[],
        }
    }
}

/// How to reach varnishstat: directly on the host, or through `docker exec`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    program: String,
    prefix: Vec<String>,
}

impl Invocation {
    pub fn direct(exe: &str) -> Self {
        Self {
            program: exe.to_string(),
            prefix: Vec::new(),
        }
    }

    pub fn in_container(container: &str, exe: &str) -> Self {
        Self {
            program: "docker".to_string(),
            prefix: vec!["exec".to_string(), container.to_string(), exe.to_string()],
        }
    }

    pub fn from_config(config: &VarnishstatConfig) -> Self {
        if config.docker_container.is_empty() {
            Self::direct(&config.path)
        } else {
            Self::in_container(&config.docker_container, &config.path)
        }
    }

    /// Full argument vector: wrapper arguments first, then `args`.
    pub fn argv(&self, args: &[String]) -> Vec<String> {
        self.prefix.iter().chain(args).cloned().collect()
    }
}

impl std::fmt::Display for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.prefix {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Run the invocation with `args` and wait at most `timeout` for it.
///
/// A non-zero exit is an error carrying everything the process printed.
pub async fn run_bounded(
    invocation: &Invocation,
    args: &[String],
    timeout: Duration,
) -> Result<Output, StatsError> {
    let argv = invocation.argv(args);
    tracing::debug!(program = %invocation.program, args = ?argv, "running varnishstat");

    let child = Command::new(&invocation.program)
        .args(&argv)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| StatsError::Spawn {
            program: invocation.program.clone(),
            source: e,
        })?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(|e| StatsError::Io { source: e })?,
        // Dropping the wait future drops the child, which kills it.
        Err(_) => return Err(StatsError::Timeout { timeout }),
    };

    if !output.status.success() {
        let mut buf = output.stdout;
        buf.extend_from_slice(&output.stderr);
        return Err(StatsError::Exit {
            code: output.status.code(),
            output: buf,
        });
    }
    Ok(output)
}

/// Instance and VSM selectors passed through to varnishstat.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsParams {
    pub instance: String,
    pub vsm: String,
}

#[derive(Debug, Clone, Copy)]
enum Selector {
    Instance,
    Vsm,
}

/// One optional varnishstat argument and the oldest release that accepts it.
struct ArgRule {
    flag: &'static str,
    selector: Selector,
    min_version: Option<(u32, u32)>,
}

const ARG_RULES: &[ArgRule] = &[
    ArgRule {
        flag: "-n",
        selector: Selector::Instance,
        min_version: None,
    },
    // -N is not supported by 3.x
    ArgRule {
        flag: "-N",
        selector: Selector::Vsm,
        min_version: Some((4, 0)),
    },
];

impl StatsParams {
    fn select(&self, selector: Selector) -> &str {
        match selector {
            Selector::Instance => &self.instance,
            Selector::Vsm => &self.vsm,
        }
    }

    /// Build the scrape arguments for `version`: `-j`, then every configured
    /// selector the release supports. Unsupported selectors are left out.
    pub fn make(&self, version: &VarnishVersion) -> Vec<String> {
        let mut args = vec!["-j".to_string()];
        for rule in ARG_RULES {
            let value = self.select(rule.selector);
            if value.is_empty() {
                continue;
            }
            if let Some((major, minor)) = rule.min_version {
                if !version.equals_or_greater(major, minor) {
                    tracing::debug!(flag = rule.flag, %version, "omitting unsupported varnishstat argument");
                    continue;
                }
            }
            args.push(rule.flag.to_string());
            args.push(value.to_string());
        }
        args
    }
}

/// The production [`StatsSource`]: a varnishstat subprocess per scrape.
#[derive(Debug, Clone)]
pub struct VarnishStat {
    invocation: Invocation,
    args: Vec<String>,
    timeout: Duration,
}

impl VarnishStat {
    /// Arguments are resolved here, once, against the probed version.
    pub fn new(config: &VarnishstatConfig, version: &VarnishVersion) -> Self {
        let params = StatsParams {
            instance: config.instance.clone(),
            vsm: config.vsm.clone(),
        };
        Self {
            invocation: Invocation::from_config(config),
            args: params.make(version),
            timeout: config.timeout(),
        }
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl StatsSource for VarnishStat {
    async fn scrape(&self) -> Result<Vec<u8>, StatsError> {
        let output = run_bounded(&self.invocation, &self.args, self.timeout).await?;
        Ok(output.stdout)
    }
}
