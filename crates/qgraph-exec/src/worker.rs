//! Runs a single quantum inside a child worker and reports back.
//!
//! The wire format is a JSON line each way: the coordinator writes a
//! [`WireRequest`], the worker writes back exactly one [`WireResponse`].
//! Nothing but that one line crosses the process boundary, satisfying the
//! "no live references, small payloads only" resource rule.

use qgraph_core::executor::ExecutorError;
use qgraph_core::quantum::{ExternalContext, QuantumPayload, TaskDef};
use qgraph_core::report::ErrorClassification;
use qgraph_core::QuantumExecutor;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Serialize, Deserialize)]
struct WireRequest {
    task_def: TaskDef,
    quantum: QuantumPayload,
    context: ExternalContext,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum WireOutcome {
    Ok { quantum: QuantumPayload },
    Err { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireResponse {
    outcome: WireOutcome,
}

/// What a completed worker reported, before the scheduler folds in wait-status
/// information (exit code, signal) it observed independently.
#[derive(Debug, Clone)]
pub enum WorkerOutcome {
    Success(QuantumPayload),
    Failure { classification: ErrorClassification, message: String, exit_code: Option<i32> },
}

/// A fresh re-exec of the current binary has no way to receive an arbitrary
/// closure, only code: the caller registers a plain function the harness
/// calls once the child has read its request off stdin. Mirrors how a
/// `spawn`-started interpreter must re-import its target rather than inherit
/// live objects from the parent.
pub type WorkerEntryPoint =
    fn(&TaskDef, QuantumPayload, &ExternalContext) -> Result<QuantumPayload, ExecutorError>;

const WORKER_MODE_ENV: &str = "QGRAPH_WORKER_MODE";

/// Call at the very top of `main()`, before touching argv or spawning a
/// scheduler. If this process was re-exec'd as a `spawn` worker, runs exactly
/// one quantum through `entry`, writes the response, and exits — this call
/// never returns in that case. Otherwise returns normally so the caller
/// proceeds as the coordinator.
pub fn run_worker_if_requested(entry: WorkerEntryPoint) {
    if std::env::var_os(WORKER_MODE_ENV).is_none() {
        return;
    }
    let stdin = std::io::stdin();
    let mut line = String::new();
    stdin
        .lock()
        .read_line(&mut line)
        .expect("worker could not read its request from stdin");
    let request: WireRequest =
        serde_json::from_str(&line).expect("worker received a malformed request");

    let outcome = match entry(&request.task_def, request.quantum, &request.context) {
        Ok(quantum) => WireOutcome::Ok { quantum },
        Err(e) => WireOutcome::Err { message: e.message },
    };
    let failed = matches!(outcome, WireOutcome::Err { .. });
    let response = WireResponse { outcome };
    let encoded = serde_json::to_string(&response).expect("worker response did not serialize");
    println!("{encoded}");
    std::io::stdout().flush().ok();
    std::process::exit(if failed { 1 } else { 0 });
}

/// A still-running (or just-completed) worker. `poll` is non-blocking; the
/// scheduler drives every handle with a polling loop rather than blocking on
/// any single one, since several may be in flight at once.
pub trait WorkerHandle: Send {
    fn poll(&mut self) -> Option<WorkerOutcome>;
    /// Soft-then-hard termination, blocking until the process is reaped.
    /// Idempotent; returns the terminal outcome to record for this node, even
    /// when termination was requested while the worker was still running (a
    /// `failFast` teardown still needs exactly one terminal report per node).
    fn terminate(&mut self) -> WorkerOutcome;
    fn dispatched_at(&self) -> Instant;
}

/// Classification used for a worker that was torn down mid-flight (fail-fast
/// cancellation) rather than one that ran to completion on its own.
fn cancelled(message: impl Into<String>) -> WorkerOutcome {
    WorkerOutcome::Failure {
        classification: ErrorClassification::KilledBySignal,
        message: message.into(),
        exit_code: None,
    }
}

fn classify_child_exit(status: std::process::ExitStatus) -> WorkerOutcome {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return WorkerOutcome::Failure {
                classification: ErrorClassification::KilledBySignal,
                message: format!("worker killed by signal {signal}"),
                exit_code: None,
            };
        }
    }
    WorkerOutcome::Failure {
        classification: ErrorClassification::HarnessCrashed,
        message: format!("worker exited with status {status}"),
        exit_code: status.code(),
    }
}

/// Reads whatever is left on `reader` after the worker has already exited.
/// Nothing is buffered across polls: the harness only reads once wait
/// confirms the process is gone, so this is always a fast drain of an
/// already-closed pipe.
fn read_final_response(reader: &mut impl BufRead) -> Option<WireResponse> {
    let mut line = String::new();
    reader.read_line(&mut line).ok()?;
    serde_json::from_str(&line).ok()
}

fn response_to_outcome(response: WireResponse, exit_code: Option<i32>) -> WorkerOutcome {
    match response.outcome {
        WireOutcome::Ok { quantum } => WorkerOutcome::Success(quantum),
        WireOutcome::Err { message } => {
            WorkerOutcome::Failure { classification: ErrorClassification::TaskRaised, message, exit_code }
        }
    }
}

/// `spawn`: a fresh re-exec of the current binary, talking over stdin/stdout.
pub struct SpawnHandle {
    child: Child,
    stdout: BufReader<std::process::ChildStdout>,
    dispatched_at: Instant,
    terminated: bool,
}

impl SpawnHandle {
    fn start(task_def: &TaskDef, quantum: QuantumPayload, context: &ExternalContext) -> std::io::Result<Self> {
        let exe = std::env::current_exe()?;
        let mut child = Command::new(exe)
            .env(WORKER_MODE_ENV, "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()?;
        debug!("spawned worker pid {} for task {:?}", child.id(), task_def.label);

        let request = WireRequest {
            task_def: task_def.clone(),
            quantum,
            context: context.clone(),
        };
        let encoded = serde_json::to_string(&request).expect("request always serializes");
        let mut stdin = child.stdin.take().expect("stdin was piped");
        writeln!(stdin, "{encoded}")?;
        drop(stdin); // EOF so the worker's read_line returns promptly.

        let stdout = BufReader::new(child.stdout.take().expect("stdout was piped"));
        Ok(Self { child, stdout, dispatched_at: Instant::now(), terminated: false })
    }
}

impl WorkerHandle for SpawnHandle {
    fn poll(&mut self) -> Option<WorkerOutcome> {
        match self.child.try_wait() {
            Ok(Some(status)) => match read_final_response(&mut self.stdout) {
                Some(response) => Some(response_to_outcome(response, status.code())),
                None => Some(classify_child_exit(status)),
            },
            Ok(None) => None,
            Err(e) => Some(WorkerOutcome::Failure {
                classification: ErrorClassification::HarnessCrashed,
                message: format!("could not poll worker: {e}"),
                exit_code: None,
            }),
        }
    }

    fn terminate(&mut self) -> WorkerOutcome {
        if self.terminated {
            return cancelled("worker already terminated");
        }
        self.terminated = true;
        if let Ok(Some(status)) = self.child.try_wait() {
            return read_final_response(&mut self.stdout)
                .map(|response| response_to_outcome(response, status.code()))
                .unwrap_or_else(|| classify_child_exit(status));
        }
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(self.child.id() as i32), Signal::SIGTERM);
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        let _ = self.child.kill();
        match self.child.wait() {
            Ok(status) => read_final_response(&mut self.stdout)
                .map(|response| response_to_outcome(response, status.code()))
                .unwrap_or_else(|| classify_child_exit(status)),
            Err(e) => cancelled(format!("worker could not be reaped after termination: {e}")),
        }
    }

    fn dispatched_at(&self) -> Instant {
        self.dispatched_at
    }
}

impl Drop for SpawnHandle {
    fn drop(&mut self) {
        // Every worker the harness starts is waited on; a handle dropped
        // while still running (e.g. a `failFast` teardown) must not leak a
        // zombie.
        if self.child.try_wait().ok().flatten().is_none() {
            self.terminate();
        }
    }
}

#[cfg(unix)]
mod posix {
    use super::*;
    use nix::sys::signal::{kill, Signal};
    use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
    use nix::unistd::{close, fork, pipe, read, write, ForkResult, Pid};
    use std::os::unix::io::RawFd;

    /// Runs one quantum in a freshly forked child and writes the JSON
    /// response to `write_fd` before exiting. Shared by `fork` and
    /// `forkserver`, which differ only in who does the forking.
    fn run_forked_child(
        write_fd: RawFd,
        executor: &Arc<dyn QuantumExecutor>,
        task_def: &TaskDef,
        quantum: QuantumPayload,
        context: &ExternalContext,
    ) -> ! {
        let outcome = match executor.execute(task_def, quantum, context) {
            Ok(quantum) => WireOutcome::Ok { quantum },
            Err(e) => WireOutcome::Err { message: e.message },
        };
        let response = WireResponse { outcome };
        let mut encoded = serde_json::to_string(&response).expect("response always serializes");
        encoded.push('\n');
        let _ = write(write_fd, encoded.as_bytes());
        let _ = close(write_fd);
        std::process::exit(0);
    }

    fn drain_pipe(read_fd: RawFd) -> Option<WireResponse> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match read(read_fd, &mut chunk) {
                Ok(0) => break,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(_) => break,
            }
        }
        serde_json::from_slice(&buf).ok()
    }

    /// The exit code `waitpid` observed, when the status names a normal exit.
    fn wait_status_exit_code(status: &WaitStatus) -> Option<i32> {
        match status {
            WaitStatus::Exited(_, code) => Some(*code),
            _ => None,
        }
    }

    pub struct ForkHandle {
        child: Pid,
        read_fd: RawFd,
        dispatched_at: Instant,
        terminated: bool,
    }

    impl ForkHandle {
        pub fn start(
            executor: &Arc<dyn QuantumExecutor>,
            task_def: &TaskDef,
            quantum: QuantumPayload,
            context: &ExternalContext,
        ) -> nix::Result<Self> {
            let (read_fd, write_fd) = pipe()?;
            match unsafe { fork()? } {
                ForkResult::Parent { child } => {
                    let _ = close(write_fd);
                    Ok(Self { child, read_fd, dispatched_at: Instant::now(), terminated: false })
                }
                ForkResult::Child => {
                    let _ = close(read_fd);
                    run_forked_child(write_fd, executor, task_def, quantum, context);
                }
            }
        }
    }

    impl WorkerHandle for ForkHandle {
        fn poll(&mut self) -> Option<WorkerOutcome> {
            match waitpid(self.child, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => None,
                Ok(status) => {
                    let exit_code = wait_status_exit_code(&status);
                    let outcome = drain_pipe(self.read_fd)
                        .map(|r| response_to_outcome(r, exit_code))
                        .unwrap_or_else(|| classify_wait_status(status));
                    Some(outcome)
                }
                Err(e) => Some(WorkerOutcome::Failure {
                    classification: ErrorClassification::HarnessCrashed,
                    message: format!("waitpid failed: {e}"),
                    exit_code: None,
                }),
            }
        }

        fn terminate(&mut self) -> WorkerOutcome {
            if self.terminated {
                return cancelled("worker already terminated");
            }
            self.terminated = true;
            let _ = kill(self.child, Signal::SIGTERM);
            std::thread::sleep(std::time::Duration::from_millis(50));
            let _ = kill(self.child, Signal::SIGKILL);
            match waitpid(self.child, None) {
                Ok(status) => {
                    let exit_code = wait_status_exit_code(&status);
                    drain_pipe(self.read_fd)
                        .map(|r| response_to_outcome(r, exit_code))
                        .unwrap_or_else(|| classify_wait_status(status))
                }
                Err(e) => cancelled(format!("worker could not be reaped after termination: {e}")),
            }
        }

        fn dispatched_at(&self) -> Instant {
            self.dispatched_at
        }
    }

    impl Drop for ForkHandle {
        fn drop(&mut self) {
            if matches!(waitpid(self.child, Some(WaitPidFlag::WNOHANG)), Ok(WaitStatus::StillAlive)) {
                self.terminate();
            }
            let _ = close(self.read_fd);
        }
    }

    fn classify_wait_status(status: WaitStatus) -> WorkerOutcome {
        match status {
            WaitStatus::Exited(_, 0) => WorkerOutcome::Failure {
                classification: ErrorClassification::HarnessCrashed,
                message: "worker exited 0 without a response".to_string(),
                exit_code: Some(0),
            },
            WaitStatus::Exited(_, code) => WorkerOutcome::Failure {
                classification: ErrorClassification::HarnessCrashed,
                message: format!("worker exited with code {code}"),
                exit_code: Some(code),
            },
            WaitStatus::Signaled(_, signal, _) => WorkerOutcome::Failure {
                classification: ErrorClassification::KilledBySignal,
                message: format!("worker killed by signal {signal}"),
                exit_code: None,
            },
            other => WorkerOutcome::Failure {
                classification: ErrorClassification::HarnessCrashed,
                message: format!("unexpected wait status {other:?}"),
                exit_code: None,
            },
        }
    }

    /// A single pre-forked server process that forks each worker on request,
    /// so the (potentially large) coordinator image is only copied once.
    pub struct ForkServer {
        server: Pid,
        request_fd: RawFd,
    }

    impl ForkServer {
        pub fn start(executor: Arc<dyn QuantumExecutor>) -> nix::Result<Self> {
            let (req_read, req_write) = pipe()?;
            match unsafe { fork()? } {
                ForkResult::Parent { child } => {
                    let _ = close(req_read);
                    Ok(Self { server: child, request_fd: req_write })
                }
                ForkResult::Child => {
                    let _ = close(req_write);
                    Self::serve(req_read, executor);
                }
            }
        }

        /// The server's main loop: read one line naming the response pipe fd
        /// number (passed as text, since it was inherited across the fork),
        /// then fork the actual worker.
        fn serve(req_read: RawFd, executor: Arc<dyn QuantumExecutor>) -> ! {
            loop {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 512];
                let job = loop {
                    match read(req_read, &mut chunk) {
                        Ok(0) => std::process::exit(0), // coordinator went away
                        Ok(n) => {
                            buf.extend_from_slice(&chunk[..n]);
                            if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                                let line = String::from_utf8_lossy(&buf[..pos]).to_string();
                                break line;
                            }
                        }
                        Err(_) => std::process::exit(1),
                    }
                };
                let job: ForkServerJob = match serde_json::from_str(&job) {
                    Ok(j) => j,
                    Err(_) => continue,
                };
                match unsafe { fork() } {
                    Ok(ForkResult::Child) => {
                        run_forked_child(job.write_fd, &executor, &job.task_def, job.quantum, &job.context);
                    }
                    _ => continue,
                }
            }
        }

        pub fn dispatch(
            &self,
            task_def: &TaskDef,
            quantum: QuantumPayload,
            context: &ExternalContext,
        ) -> nix::Result<ForkHandleLike> {
            let (read_fd, write_fd) = pipe()?;
            let job = ForkServerJob {
                write_fd,
                task_def: task_def.clone(),
                quantum,
                context: context.clone(),
            };
            let mut encoded = serde_json::to_string(&job).expect("job always serializes");
            encoded.push('\n');
            write(self.request_fd, encoded.as_bytes())?;
            let _ = close(write_fd); // parent's copy; the forked grandchild keeps its own
            Ok(ForkHandleLike { read_fd, dispatched_at: Instant::now(), terminated: false })
        }
    }

    impl Drop for ForkServer {
        fn drop(&mut self) {
            let _ = close(self.request_fd);
            let _ = kill(self.server, Signal::SIGTERM);
            let _ = waitpid(self.server, None);
        }
    }

    #[derive(Serialize, Deserialize)]
    struct ForkServerJob {
        write_fd: RawFd,
        task_def: TaskDef,
        quantum: QuantumPayload,
        context: ExternalContext,
    }

    /// A worker dispatched via the fork server: tracked by its own result
    /// pipe rather than a pid, since the coordinator never sees the
    /// grandchild's pid directly and instead waits on the server's behalf by
    /// reading for EOF+data on the pipe.
    pub struct ForkHandleLike {
        read_fd: RawFd,
        dispatched_at: Instant,
        terminated: bool,
    }

    impl WorkerHandle for ForkHandleLike {
        fn poll(&mut self) -> Option<WorkerOutcome> {
            use nix::fcntl::{fcntl, FcntlArg, OFlag};
            let _ = fcntl(self.read_fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK));
            let mut chunk = [0u8; 4096];
            match read(self.read_fd, &mut chunk) {
                Ok(0) => Some(WorkerOutcome::Failure {
                    classification: ErrorClassification::HarnessCrashed,
                    message: "forkserver worker closed its pipe without responding".to_string(),
                    exit_code: None,
                }),
                Ok(n) => serde_json::from_slice::<WireResponse>(&chunk[..n])
                    .ok()
                    .map(|r| response_to_outcome(r, None)),
                Err(nix::errno::Errno::EAGAIN) => None,
                Err(e) => Some(WorkerOutcome::Failure {
                    classification: ErrorClassification::HarnessCrashed,
                    message: format!("forkserver pipe read failed: {e}"),
                    exit_code: None,
                }),
            }
        }

        fn terminate(&mut self) -> WorkerOutcome {
            // The grandchild's pid is not tracked by the coordinator; closing
            // its result pipe is the signal it (and the kernel) act on. There
            // is no pid to wait on here, so unlike the other start methods
            // this can't distinguish "raced to completion" from "killed" —
            // it is always reported as cancelled.
            if self.terminated {
                return cancelled("worker already terminated");
            }
            self.terminated = true;
            let _ = close(self.read_fd);
            cancelled("worker cancelled by fail-fast teardown")
        }

        fn dispatched_at(&self) -> Instant {
            self.dispatched_at
        }
    }

    impl Drop for ForkHandleLike {
        fn drop(&mut self) {
            if !self.terminated {
                let _ = close(self.read_fd);
            }
        }
    }
}

#[cfg(unix)]
pub use posix::{ForkHandle, ForkHandleLike, ForkServer};

/// Starts and polls workers according to the configured start method.
///
/// For `fork`/`forkserver` the in-process `executor` is shared with the
/// child by plain copy-on-write inheritance (the whole point of `fork`); for
/// `spawn` the child is a fresh process image and must call
/// [`run_worker_if_requested`] with its own registered entry point instead.
pub struct WorkerHarness {
    executor: Arc<dyn QuantumExecutor>,
    #[cfg(unix)]
    fork_server: Option<posix::ForkServer>,
}

impl WorkerHarness {
    pub fn new(executor: Arc<dyn QuantumExecutor>) -> Self {
        Self {
            executor,
            #[cfg(unix)]
            fork_server: None,
        }
    }

    #[cfg(unix)]
    pub fn ensure_fork_server(&mut self) -> std::io::Result<()> {
        if self.fork_server.is_none() {
            self.fork_server = Some(
                posix::ForkServer::start(self.executor.clone())
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?,
            );
        }
        Ok(())
    }

    pub fn dispatch_spawn(
        &self,
        task_def: &TaskDef,
        quantum: QuantumPayload,
        context: &ExternalContext,
    ) -> std::io::Result<Box<dyn WorkerHandle>> {
        Ok(Box::new(SpawnHandle::start(task_def, quantum, context)?))
    }

    #[cfg(unix)]
    pub fn dispatch_fork(
        &self,
        task_def: &TaskDef,
        quantum: QuantumPayload,
        context: &ExternalContext,
    ) -> nix::Result<Box<dyn WorkerHandle>> {
        Ok(Box::new(posix::ForkHandle::start(&self.executor, task_def, quantum, context)?))
    }

    #[cfg(unix)]
    pub fn dispatch_forkserver(
        &mut self,
        task_def: &TaskDef,
        quantum: QuantumPayload,
        context: &ExternalContext,
    ) -> std::io::Result<Box<dyn WorkerHandle>> {
        self.ensure_fork_server()?;
        let handle = self
            .fork_server
            .as_ref()
            .expect("ensured above")
            .dispatch(task_def, quantum, context)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        Ok(Box::new(handle))
    }
}
