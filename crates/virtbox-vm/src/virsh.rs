//! Control plane backed by the `virsh` command line client.
//!
//! With the embedded QEMU driver the client process is the driver and holds
//! the lock on its root, so a connection is one long-lived `virsh` shell.
//! Commands go to its stdin one at a time. Each is followed by an `echo` of a
//! marker on stdout and on stderr, which frames the reply. The shell runs its
//! own event loop; the shell exiting is the end of the event stream.

use crate::control::{Connection, ControlPlane, Domain};
use crate::error::{Result, VmError};
use async_trait::async_trait;
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use uuid::Uuid;

const DEFAULT_VIRSH: &str = "virsh";

/// Printed after every command to mark the end of its output.
const MARKER: &str = "__virtbox_done__";

/// Shell prompt, printed even when stdin is not a terminal.
const PROMPT: &str = "virsh # ";

/// [`ControlPlane`] that drives a `virsh` shell per connection.
#[derive(Debug, Clone)]
pub struct VirshControlPlane {
    binary: PathBuf,
}

impl Default for VirshControlPlane {
    fn default() -> Self {
        Self::new(DEFAULT_VIRSH)
    }
}

impl VirshControlPlane {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl ControlPlane for VirshControlPlane {
    async fn register_event_loop(&self) -> Result<()> {
        // virsh registers and runs the default event loop itself.
        Ok(())
    }

    async fn connect(&self, uri: &str) -> Result<Arc<dyn Connection>> {
        let shell = Arc::new(Shell::spawn(&self.binary, uri)?);

        // Round trip so an unusable root fails here, not on define
        shell
            .run("uri", &["uri"])
            .await
            .map_err(|e| VmError::Connect(e.to_string()))?;

        tracing::debug!(uri, "Connected to libvirt");
        Ok(Arc::new(VirshConnection { shell }))
    }
}

struct ShellIo {
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    stderr: Lines<BufReader<ChildStderr>>,
}

/// One interactive `virsh -c <uri>` process.
struct Shell {
    io: Mutex<ShellIo>,
    child: Mutex<Child>,
}

impl Shell {
    fn spawn(binary: &Path, uri: &str) -> Result<Self> {
        let mut child = Command::new(binary)
            .args(["--quiet", "-c", uri])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VmError::Connect(format!("failed to spawn {}: {e}", binary.display())))?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(VmError::Connect("virsh shell has no stdio".into()));
        };

        tracing::trace!(uri, pid = ?child.id(), "virsh shell spawned");

        Ok(Self {
            io: Mutex::new(ShellIo {
                stdin,
                stdout: BufReader::new(stdout).lines(),
                stderr: BufReader::new(stderr).lines(),
            }),
            child: Mutex::new(child),
        })
    }

    /// Run one command and return its stdout.
    ///
    /// Any `error:` line on stderr makes the command a rejection.
    async fn run(&self, op: &'static str, args: &[&str]) -> Result<String> {
        let line = command_line(args);
        tracing::trace!(op, command = %line, "Running virsh");

        let mut io = self.io.lock().await;
        let script = format!("{line}\necho {MARKER}\necho --err {MARKER}\n");
        io.stdin
            .write_all(script.as_bytes())
            .await
            .map_err(|e| shell_gone(op, e))?;
        io.stdin.flush().await.map_err(|e| shell_gone(op, e))?;

        let stdout = read_reply(&mut io.stdout)
            .await
            .map_err(|e| shell_gone(op, e))?;
        let stderr = read_reply(&mut io.stderr)
            .await
            .map_err(|e| shell_gone(op, e))?;

        let errors: Vec<&str> = stderr
            .iter()
            .map(String::as_str)
            .filter(|l| l.starts_with("error:"))
            .collect();
        if !errors.is_empty() {
            return Err(VmError::rejected(op, errors.join("; ")));
        }
        Ok(stdout.join("\n"))
    }

    /// Wait for the shell to exit.
    async fn wait(&self) -> Result<String> {
        let status = self
            .child
            .lock()
            .await
            .wait()
            .await
            .map_err(|e| VmError::EventLoop(e.to_string()))?;
        Ok(status.to_string())
    }
}

fn shell_gone(op: &'static str, e: std::io::Error) -> VmError {
    VmError::rejected(op, format!("virsh shell is gone: {e}"))
}

/// Collect non-empty lines up to the marker, with prompts stripped.
async fn read_reply<R>(lines: &mut Lines<R>) -> std::io::Result<Vec<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut reply = Vec::new();
    loop {
        let Some(line) = lines.next_line().await? else {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        };
        let line = strip_prompt(&line).trim_end();
        if line == MARKER {
            return Ok(reply);
        }
        if !line.is_empty() {
            reply.push(line.to_string());
        }
    }
}

fn strip_prompt(mut line: &str) -> &str {
    while let Some(rest) = line.strip_prefix(PROMPT) {
        line = rest;
    }
    line
}

/// Quote an argument for the virsh shell parser when it needs it.
fn quote(arg: &str) -> Cow<'_, str> {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=?,@+".contains(c));
    if plain {
        return Cow::Borrowed(arg);
    }
    let escaped = arg.replace('\\', "\\\\").replace('"', "\\\"");
    Cow::Owned(format!("\"{escaped}\""))
}

fn command_line(args: &[&str]) -> String {
    args.iter()
        .map(|a| quote(a))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse the count printed by `virsh vcpucount`.
fn parse_vcpu_count(output: &str) -> Result<u32> {
    output
        .lines()
        .rev()
        .find_map(|l| l.trim().parse().ok())
        .ok_or_else(|| {
            VmError::rejected("vcpucount", format!("unexpected output {:?}", output.trim()))
        })
}

struct VirshConnection {
    shell: Arc<Shell>,
}

impl VirshConnection {
    fn domain(&self, name: &str) -> Arc<dyn Domain> {
        Arc::new(VirshDomain {
            shell: self.shell.clone(),
            name: name.to_string(),
        })
    }
}

#[async_trait]
impl Connection for VirshConnection {
    async fn define_xml(&self, name: &str, xml: &str) -> Result<Arc<dyn Domain>> {
        // stdin carries the command stream, so the XML goes through a file
        let path = std::env::temp_dir().join(format!("virtbox-{}.xml", Uuid::new_v4().simple()));
        tokio::fs::write(&path, xml)
            .await
            .map_err(|e| VmError::fs(&path, e))?;

        let path_arg = path.display().to_string();
        let outcome = self.shell.run("define", &["define", &path_arg]).await;

        if let Err(e) = tokio::fs::remove_file(&path).await {
            tracing::debug!(path = %path.display(), error = %e, "Failed to remove domain XML file");
        }
        outcome?;

        Ok(self.domain(name))
    }

    async fn lookup_by_name(&self, name: &str) -> Result<Arc<dyn Domain>> {
        self.shell.run("lookup", &["domuuid", name]).await?;
        Ok(self.domain(name))
    }

    async fn next_event(&self) -> Result<String> {
        let status = self.shell.wait().await?;
        Err(VmError::EventLoop(format!("virsh shell exited: {status}")))
    }
}

struct VirshDomain {
    shell: Arc<Shell>,
    name: String,
}

#[async_trait]
impl Domain for VirshDomain {
    async fn create(&self) -> Result<()> {
        self.shell.run("create", &["start", &self.name]).await?;
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        self.shell.run("destroy", &["destroy", &self.name]).await?;
        Ok(())
    }

    async fn undefine(&self) -> Result<()> {
        self.shell.run("undefine", &["undefine", &self.name]).await?;
        Ok(())
    }

    async fn live_vcpus(&self) -> Result<u32> {
        let out = self
            .shell
            .run("vcpucount", &["vcpucount", &self.name, "--live", "--current"])
            .await?;
        parse_vcpu_count(&out)
    }

    async fn set_live_vcpus(&self, count: u32) -> Result<()> {
        let count = count.to_string();
        self.shell
            .run("setvcpus", &["setvcpus", &self.name, &count, "--live"])
            .await?;
        Ok(())
    }
}
