//! Remote configuration of a freshly booted server.
//!
//! The configurator runs a fixed, ordered list of bash scripts over one
//! multiplexed ssh connection. Each script has its own deadline; a failed or
//! timed-out script aborts the remaining ones.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use agenthost_common::{ProvisionError, ServerInfo, ServerSecret};
use agenthost_providers::readiness;
use anyhow::Result;
use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use uuid::Uuid;

use crate::config::SshSettings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait RemoteShell: Send {
    /// Run a bash script on the host. Exceeding `timeout` is a
    /// `ProvisionError::Timeout`; a non-zero exit is returned, not raised.
    async fn run(&mut self, script: &str, timeout: Duration) -> Result<CommandOutput>;

    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait ShellConnector: Send + Sync {
    async fn connect(&self, server: &ServerInfo) -> Result<Box<dyn RemoteShell>>;
}

/// Safe single-quote escape for bash.
pub fn sh_escape_single(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\"'\"'"))
}

fn tail_str(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    s.chars()
        .rev()
        .take(max_chars)
        .collect::<String>()
        .chars()
        .rev()
        .collect()
}

// --- ssh ---

enum SshAuth {
    KeyFile { path: PathBuf, temporary: bool },
    Password(String),
}

/// Opens [`SshShell`]s with the system `ssh` binary.
pub struct SshConnector {
    settings: SshSettings,
    port: u16,
}

impl SshConnector {
    pub fn new(settings: SshSettings, port: u16) -> Self {
        Self { settings, port }
    }
}

fn write_private_key(path: &Path, material: &str) -> Result<()> {
    use std::io::Write;

    let mut opts = std::fs::OpenOptions::new();
    opts.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    let mut f = opts.open(path)?;
    f.write_all(material.trim_end().as_bytes())?;
    f.write_all(b"\n")?;
    Ok(())
}

#[async_trait]
impl ShellConnector for SshConnector {
    async fn connect(&self, server: &ServerInfo) -> Result<Box<dyn RemoteShell>> {
        let ip = server.clean_ip().ok_or_else(|| {
            ProvisionError::Provider(format!("server {} has no public ip", server.id))
        })?;
        let creds = server.credentials.as_ref();
        let user = creds
            .map(|c| c.username.clone())
            .unwrap_or_else(|| self.settings.user.clone());

        let auth = match (creds.map(|c| &c.secret), &self.settings.private_key_file) {
            (Some(ServerSecret::PrivateKey(material)), _) => {
                let path = std::env::temp_dir().join(format!("agenthost-key-{}", Uuid::new_v4().simple()));
                write_private_key(&path, material)?;
                SshAuth::KeyFile {
                    path,
                    temporary: true,
                }
            }
            (_, Some(path)) => SshAuth::KeyFile {
                path: path.clone(),
                temporary: false,
            },
            (Some(ServerSecret::Password(pw)), None) => SshAuth::Password(pw.clone()),
            (None, None) => {
                return Err(ProvisionError::Configuration(format!(
                    "no ssh credentials for server {} (set SSH_PRIVATE_KEY_FILE)",
                    server.id
                ))
                .into())
            }
        };

        let control_path = std::env::temp_dir().join(format!(
            "agenthost-cm-{}",
            &Uuid::new_v4().simple().to_string()[..12]
        ));
        tracing::debug!("[ssh] opening shell to {}@{}:{}", user, ip, self.port);
        Ok(Box::new(SshShell {
            target: format!("{}@{}", user, ip),
            port: self.port,
            auth,
            control_path,
            connect_timeout: self.settings.connect_timeout,
            opened: false,
        }))
    }
}

/// One ssh ControlMaster per configuration attempt; every `run` reuses it.
pub struct SshShell {
    target: String,
    port: u16,
    auth: SshAuth,
    control_path: PathBuf,
    connect_timeout: Duration,
    opened: bool,
}

impl SshShell {
    fn command(&self) -> Command {
        let mut cmd = match &self.auth {
            SshAuth::Password(pw) => {
                let mut c = Command::new("sshpass");
                c.arg("-e").arg("ssh").env("SSHPASS", pw);
                c
            }
            SshAuth::KeyFile { path, .. } => {
                let mut c = Command::new("ssh");
                c.arg("-i").arg(path).arg("-o").arg("BatchMode=yes");
                c
            }
        };
        cmd.arg("-p")
            .arg(self.port.to_string())
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg("UserKnownHostsFile=/dev/null")
            .arg("-o")
            .arg("LogLevel=ERROR")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)))
            .arg("-o")
            .arg("ControlMaster=auto")
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg("-o")
            .arg("ControlPersist=300");
        cmd
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn run(&mut self, script: &str, timeout: Duration) -> Result<CommandOutput> {
        let mut child = self
            .command()
            .arg(&self.target)
            .arg("bash -s")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProvisionError::Configuration(format!("ssh spawn failed: {}", e)))?;
        self.opened = true;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.as_bytes()).await?;
        }

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(res) => res?,
            Err(_) => {
                return Err(ProvisionError::Timeout(format!(
                    "remote command on {} exceeded {}s",
                    self.target,
                    timeout.as_secs()
                ))
                .into())
            }
        };
        Ok(CommandOutput {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn close(&mut self) -> Result<()> {
        if self.opened {
            let res = self
                .command()
                .arg("-O")
                .arg("exit")
                .arg(&self.target)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            if let Err(e) = res {
                tracing::debug!("[ssh] control master exit failed for {}: {}", self.target, e);
            }
            self.opened = false;
        }
        if let SshAuth::KeyFile {
            path,
            temporary: true,
        } = &self.auth
        {
            let _ = std::fs::remove_file(path);
        }
        Ok(())
    }
}

impl Drop for SshShell {
    fn drop(&mut self) {
        if let SshAuth::KeyFile {
            path,
            temporary: true,
        } = &self.auth
        {
            let _ = std::fs::remove_file(path);
        }
    }
}

// --- configurator ---

#[derive(Debug, Clone)]
pub struct ConfiguratorOptions {
    pub bootstrap_port: u16,
    pub bootstrap_attempts: u32,
    pub bootstrap_interval: Duration,
    pub probe_timeout: Duration,
    pub command_timeout: Duration,
    pub config_dir: String,
    pub service_name: String,
    pub exec_start: String,
}

impl Default for ConfiguratorOptions {
    fn default() -> Self {
        Self {
            bootstrap_port: 22,
            bootstrap_attempts: 36,
            bootstrap_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(3),
            command_timeout: Duration::from_secs(120),
            config_dir: "/etc/agenthost".to_string(),
            service_name: "agenthost-agent".to_string(),
            exec_start: "/usr/local/bin/agenthost-agent --config /etc/agenthost/agent.json"
                .to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigureRequest {
    pub instance_id: Uuid,
    pub owner_email: String,
    pub owner_name: Option<String>,
    pub plan_id: String,
    pub config: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigureOutcome {
    pub success: bool,
    pub error: Option<String>,
}

impl ConfigureOutcome {
    fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    fn failed(message: String) -> Self {
        Self {
            success: false,
            error: Some(message),
        }
    }
}

/// A labelled script; the label is what shows up in logs and errors.
#[derive(Debug, Clone)]
pub struct RemoteStep {
    pub label: &'static str,
    pub script: String,
}

/// Atomic write of `content` to `path` with `mode`, via a temp file in the
/// same directory. Content travels base64-encoded.
pub fn write_file_script(path: &str, content: &str, mode: &str) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(content.as_bytes());
    let dir = Path::new(path)
        .parent()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "/tmp".to_string());
    format!(
        "set -euo pipefail\n\
         umask 077\n\
         tmp=\"$(mktemp {dir}/.agenthost.XXXXXX)\"\n\
         printf '%s' {data} | base64 -d > \"$tmp\"\n\
         chmod {mode} \"$tmp\"\n\
         mv -f \"$tmp\" {path}\n",
        dir = sh_escape_single(&dir),
        data = sh_escape_single(&encoded),
        mode = mode,
        path = sh_escape_single(path),
    )
}

fn is_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// systemd `EnvironmentFile` body from the `env` object of a config.
pub fn env_file_contents(config: &Value) -> String {
    let mut out = String::from("# managed by agenthost\n");
    let Some(vars) = config.get("env").and_then(|v| v.as_object()) else {
        return out;
    };
    let mut keys: Vec<&String> = vars.keys().collect();
    keys.sort();
    for key in keys {
        if !is_env_key(key) {
            tracing::warn!("[remote] skipping invalid env key '{}'", key);
            continue;
        }
        let value = match &vars[key] {
            Value::String(s) => s.clone(),
            Value::Null => continue,
            other => other.to_string(),
        };
        let escaped = value
            .replace('\\', "\\\\")
            .replace('"', "\\\"")
            .replace('\n', "\\n");
        out.push_str(&format!("{}=\"{}\"\n", key, escaped));
    }
    out
}

pub fn systemd_unit(options: &ConfiguratorOptions) -> String {
    format!(
        "[Unit]\n\
         Description=agenthost agent\n\
         After=network-online.target\n\
         Wants=network-online.target\n\
         \n\
         [Service]\n\
         Type=simple\n\
         EnvironmentFile=-{dir}/agent.env\n\
         ExecStart={exec}\n\
         Restart=always\n\
         RestartSec=5\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        dir = options.config_dir,
        exec = options.exec_start,
    )
}

pub struct RemoteConfigurator {
    connector: Arc<dyn ShellConnector>,
    options: ConfiguratorOptions,
}

impl RemoteConfigurator {
    pub fn new(connector: Arc<dyn ShellConnector>, options: ConfiguratorOptions) -> Self {
        Self { connector, options }
    }

    pub fn options(&self) -> &ConfiguratorOptions {
        &self.options
    }

    /// The ordered scripts for one request. Config-dependent steps are left
    /// out when the request carries no configuration.
    pub fn steps(&self, request: &ConfigureRequest) -> Vec<RemoteStep> {
        let dir = &self.options.config_dir;
        let service = &self.options.service_name;
        let mut steps = vec![
            RemoteStep {
                label: "wait for cloud-init",
                script: "if command -v cloud-init >/dev/null 2>&1; then cloud-init status --wait >/dev/null 2>&1 || true; fi\n"
                    .to_string(),
            },
            RemoteStep {
                label: "prepare config directory",
                script: format!(
                    "set -euo pipefail\ninstall -d -m 0700 {}\n",
                    sh_escape_single(dir)
                ),
            },
            RemoteStep {
                label: "write owner metadata",
                script: write_file_script(
                    &format!("{}/owner.json", dir),
                    &json!({
                        "instanceId": request.instance_id,
                        "ownerEmail": request.owner_email,
                        "ownerName": request.owner_name,
                        "planId": request.plan_id,
                    })
                    .to_string(),
                    "0600",
                ),
            },
        ];

        if let Some(config) = &request.config {
            steps.push(RemoteStep {
                label: "write service config",
                script: write_file_script(
                    &format!("{}/agent.json", dir),
                    &serde_json::to_string_pretty(config).unwrap_or_else(|_| config.to_string()),
                    "0600",
                ),
            });
            steps.push(RemoteStep {
                label: "write environment file",
                script: write_file_script(
                    &format!("{}/agent.env", dir),
                    &env_file_contents(config),
                    "0600",
                ),
            });
        }

        let unit_path = format!("/etc/systemd/system/{}.service", service);
        let mut install = write_file_script(&unit_path, &systemd_unit(&self.options), "0644");
        install.push_str(&format!(
            "systemctl daemon-reload\nsystemctl enable {}\n",
            sh_escape_single(service)
        ));
        steps.push(RemoteStep {
            label: "install service",
            script: install,
        });

        if request.config.is_some() {
            steps.push(RemoteStep {
                label: "start service",
                script: format!(
                    "set -euo pipefail\nsystemctl restart {svc}\nsleep 1\nsystemctl is-active --quiet {svc}\n",
                    svc = sh_escape_single(service)
                ),
            });
        }
        steps
    }

    /// Never raises: failures come back in the outcome.
    pub async fn configure(&self, server: &ServerInfo, request: &ConfigureRequest) -> ConfigureOutcome {
        match self.try_configure(server, request).await {
            Ok(()) => {
                tracing::info!(
                    "[remote] instance {} configured on server {}",
                    request.instance_id,
                    server.id
                );
                ConfigureOutcome::ok()
            }
            Err(e) => {
                tracing::warn!(
                    "[remote] configuration of instance {} on server {} failed: {:#}",
                    request.instance_id,
                    server.id,
                    e
                );
                ConfigureOutcome::failed(format!("{:#}", e))
            }
        }
    }

    async fn try_configure(&self, server: &ServerInfo, request: &ConfigureRequest) -> Result<()> {
        let ip = server.clean_ip().ok_or_else(|| {
            ProvisionError::Provider(format!("server {} has no public ip", server.id))
        })?;
        readiness::wait_for_port(
            ip,
            self.options.bootstrap_port,
            self.options.bootstrap_attempts,
            self.options.bootstrap_interval,
            self.options.probe_timeout,
        )
        .await?;

        let mut shell = self.connector.connect(server).await?;
        let result = self.run_steps(shell.as_mut(), request).await;
        if let Err(e) = shell.close().await {
            tracing::debug!("[remote] closing shell to {} failed: {}", server.id, e);
        }
        result
    }

    async fn run_steps(&self, shell: &mut dyn RemoteShell, request: &ConfigureRequest) -> Result<()> {
        for step in self.steps(request) {
            tracing::debug!("[remote] {}: {}", request.instance_id, step.label);
            let out = shell
                .run(&step.script, self.options.command_timeout)
                .await
                .map_err(|e| e.context(format!("{} failed", step.label)))?;
            if !out.success {
                return Err(anyhow::anyhow!(
                    "{} failed (exit={}): {}",
                    step.label,
                    out.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "signal".into()),
                    tail_str(out.stderr.trim(), 2000)
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agenthost_common::ServerStatus;
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct Script {
        runs: Mutex<Vec<String>>,
        closed: Mutex<bool>,
        fail_when: Option<&'static str>,
        timeout_when: Option<&'static str>,
    }

    struct FakeShell(Arc<Script>);

    #[async_trait]
    impl RemoteShell for FakeShell {
        async fn run(&mut self, script: &str, timeout: Duration) -> Result<CommandOutput> {
            self.0.runs.lock().unwrap().push(script.to_string());
            if self.0.timeout_when.is_some_and(|s| script.contains(s)) {
                return Err(ProvisionError::Timeout(format!("exceeded {}s", timeout.as_secs())).into());
            }
            let fail = self.0.fail_when.is_some_and(|s| script.contains(s));
            Ok(CommandOutput {
                success: !fail,
                exit_code: Some(if fail { 1 } else { 0 }),
                stdout: String::new(),
                stderr: if fail { "unit not found".into() } else { String::new() },
            })
        }

        async fn close(&mut self) -> Result<()> {
            *self.0.closed.lock().unwrap() = true;
            Ok(())
        }
    }

    struct FakeConnector(Arc<Script>);

    #[async_trait]
    impl ShellConnector for FakeConnector {
        async fn connect(&self, _server: &ServerInfo) -> Result<Box<dyn RemoteShell>> {
            Ok(Box::new(FakeShell(self.0.clone())))
        }
    }

    async fn listener() -> (TcpListener, u16) {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = l.local_addr().unwrap().port();
        (l, port)
    }

    fn server() -> ServerInfo {
        ServerInfo {
            id: "srv-1".into(),
            name: "linux-1".into(),
            ip: Some("127.0.0.1".into()),
            status: ServerStatus::Running,
            credentials: None,
        }
    }

    fn request(config: Option<Value>) -> ConfigureRequest {
        ConfigureRequest {
            instance_id: Uuid::new_v4(),
            owner_email: "o@example.com".into(),
            owner_name: Some("O'Brien".into()),
            plan_id: "linux".into(),
            config,
        }
    }

    fn configurator(script: Arc<Script>, port: u16) -> RemoteConfigurator {
        RemoteConfigurator::new(
            Arc::new(FakeConnector(script)),
            ConfiguratorOptions {
                bootstrap_port: port,
                bootstrap_attempts: 3,
                bootstrap_interval: Duration::from_millis(10),
                probe_timeout: Duration::from_millis(500),
                ..ConfiguratorOptions::default()
            },
        )
    }

    fn decode_written(script: &str) -> String {
        let start = script.find("printf '%s' '").unwrap() + "printf '%s' '".len();
        let end = script[start..].find('\'').unwrap() + start;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&script[start..end])
            .unwrap();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn escape_single_quotes() {
        assert_eq!(sh_escape_single("plain"), "'plain'");
        assert_eq!(sh_escape_single("it's"), "'it'\"'\"'s'");
    }

    #[test]
    fn env_file_quotes_values_and_skips_bad_keys() {
        let body = env_file_contents(&json!({"env": {
            "API_KEY": "a\"b",
            "PORT": 8080,
            "bad-key": "x",
            "EMPTY": null
        }}));
        assert!(body.contains("API_KEY=\"a\\\"b\"\n"));
        assert!(body.contains("PORT=\"8080\"\n"));
        assert!(!body.contains("bad-key"));
        assert!(!body.contains("EMPTY"));
    }

    #[test]
    fn steps_without_config_skip_config_writes() {
        let c = configurator(Arc::new(Script::default()), 22);
        let labels: Vec<&str> = c.steps(&request(None)).iter().map(|s| s.label).collect();
        assert_eq!(
            labels,
            vec![
                "wait for cloud-init",
                "prepare config directory",
                "write owner metadata",
                "install service"
            ]
        );
    }

    #[tokio::test]
    async fn full_run_writes_config_and_starts_service() {
        let (_l, port) = listener().await;
        let script = Arc::new(Script::default());
        let config = json!({"channels": {"telegram": {"botToken": "123:abc"}}, "env": {"A": "1"}});

        let outcome = configurator(script.clone(), port)
            .configure(&server(), &request(Some(config.clone())))
            .await;
        assert_eq!(outcome, ConfigureOutcome::ok());

        let runs = script.runs.lock().unwrap().clone();
        assert_eq!(runs.len(), 7);
        assert!(runs[1].contains("install -d -m 0700 '/etc/agenthost'"));
        assert!(runs[3].contains("chmod 0600"));
        assert!(runs[3].contains("'/etc/agenthost/agent.json'"));
        let written: Value = serde_json::from_str(&decode_written(&runs[3])).unwrap();
        assert_eq!(written, config);
        assert!(decode_written(&runs[4]).contains("A=\"1\""));
        assert!(runs[6].contains("systemctl restart 'agenthost-agent'"));
        assert!(*script.closed.lock().unwrap());
    }

    #[tokio::test]
    async fn failed_step_stops_the_sequence() {
        let (_l, port) = listener().await;
        let script = Arc::new(Script {
            fail_when: Some("systemctl enable"),
            ..Default::default()
        });

        let outcome = configurator(script.clone(), port)
            .configure(&server(), &request(Some(json!({"a": 1}))))
            .await;
        assert!(!outcome.success);
        let err = outcome.error.unwrap();
        assert!(err.contains("install service failed"), "{}", err);
        assert!(err.contains("unit not found"));
        // "start service" never ran.
        assert_eq!(script.runs.lock().unwrap().len(), 6);
        assert!(*script.closed.lock().unwrap());
    }

    #[tokio::test]
    async fn command_timeout_aborts_with_timeout() {
        let (_l, port) = listener().await;
        let script = Arc::new(Script {
            timeout_when: Some("cloud-init status"),
            ..Default::default()
        });
        let outcome = configurator(script.clone(), port)
            .configure(&server(), &request(None))
            .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("timed out"));
        assert_eq!(script.runs.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unreachable_bootstrap_port_never_opens_a_shell() {
        let port = {
            let (l, port) = listener().await;
            drop(l);
            port
        };
        let script = Arc::new(Script::default());
        let outcome = configurator(script.clone(), port)
            .configure(&server(), &request(None))
            .await;
        assert!(!outcome.success);
        assert!(script.runs.lock().unwrap().is_empty());
    }

    #[test]
    fn owner_metadata_is_base64_encoded() {
        let c = configurator(Arc::new(Script::default()), 22);
        let steps = c.steps(&request(None));
        let owner = &steps[2].script;
        assert!(!owner.contains("O'Brien"));
        let decoded: Value = serde_json::from_str(&decode_written(owner)).unwrap();
        assert_eq!(decoded["ownerName"], "O'Brien");
    }
}
