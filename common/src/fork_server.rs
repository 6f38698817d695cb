// peer: the fuzzer's fork server executor, on FORKSRV_FD and FORKSRV_FD + 1
use crate::{
    config::{FORKSRV_FD, FORKSRV_HELLO},
    defs,
    tsl::{self, RelayPipe, TranslationRequest},
};

use byteorder::{NativeEndian, WriteBytesExt};
use snafu::{ResultExt, Snafu};
use std::{
    fs::File,
    io::{self, Read, Write},
    os::unix::io::{FromRawFd, IntoRawFd, RawFd},
    result, thread,
    time::Duration,
};

/// The two pipes shared with the fuzzer. Dropping the channel closes both,
/// unless the fork server went standalone, which hands them back untouched.
#[derive(Debug)]
pub struct ForkServerChannel {
    command_in: File,
    status_out: File,
}

impl ForkServerChannel {
    pub fn new(command_in: File, status_out: File) -> Self {
        Self {
            command_in,
            status_out,
        }
    }

    /// Takes ownership of two already open descriptors.
    ///
    /// # Safety
    ///
    /// Both descriptors must not be owned by anything else in this process.
    pub unsafe fn from_raw_fds(command_in: RawFd, status_out: RawFd) -> Self {
        Self::new(File::from_raw_fd(command_in), File::from_raw_fd(status_out))
    }

    /// Channel on the descriptors inherited from the fuzzer.
    ///
    /// # Safety
    ///
    /// Same as [`ForkServerChannel::from_raw_fds`], for `FORKSRV_FD` and
    /// `FORKSRV_FD + 1`.
    /// Without a fuzzer these descriptors are usually not open at all.
    pub unsafe fn inherited() -> Self {
        Self::from_raw_fds(FORKSRV_FD, FORKSRV_FD + 1)
    }

    /// Gives up ownership without closing either descriptor.
    pub fn release(self) -> (RawFd, RawFd) {
        (self.command_in.into_raw_fd(), self.status_out.into_raw_fd())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ForkServerOptions {
    /// Descriptor on which children relay translation requests, `None` keeps
    /// the relay inert.
    pub relay_fd: Option<RawFd>,
    /// Delay between two iterations.
    pub pace: Option<Duration>,
}

/// What the caller is after `ForkServer::run` returned successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Nobody answered the hello, run the target without supervision.
    Standalone,
    /// Freshly forked child, run one test case.
    Child,
}

/// Callbacks invoked at fixed points of each iteration.
pub trait ForkServerHooks {
    /// Executed in the fork server right before `fork`.
    fn pre_fork(&mut self) {}
    /// Executed in the child, after the channel has been closed.
    fn in_child(&mut self) {}
    /// Executed in the fork server once the child PID has been announced.
    fn after_spawn(&mut self, _child_pid: libc::pid_t) {}
    /// Looks up or generates a translation requested by the running child.
    fn warm_translation(&mut self, _request: &TranslationRequest) {}
    /// Executed in the fork server once the status has been reported.
    fn iteration_end(&mut self, _status: i32) {}
}

impl ForkServerHooks for () {}

#[derive(Debug)]
pub struct ForkServer {
    channel: ForkServerChannel,
    options: ForkServerOptions,
}

impl ForkServer {
    pub fn new(channel: ForkServerChannel, options: ForkServerOptions) -> Self {
        Self { channel, options }
    }

    /// Runs the fork server loop.
    ///
    /// In the fork server process this only returns if the fuzzer is absent
    /// (`Ok(Role::Standalone)`) or on error. Every child returns
    /// `Ok(Role::Child)`.
    pub fn run<H: ForkServerHooks>(self, hooks: &mut H) -> Result<Role> {
        let ForkServer {
            mut channel,
            options,
        } = self;

        // If the fuzzer does not want to talk, we are not in fork server mode.
        if let Err(error) = channel.status_out.write_all(&FORKSRV_HELLO) {
            log::debug!("Fuzzer not listening, running standalone: {}", error);
            // Possibly never opened, or owned by someone else. Leave them be.
            channel.release();
            return Ok(Role::Standalone);
        }
        log::debug!("Fork server started, pid {}", unsafe { libc::getpid() });

        let mut iteration: u64 = 0;
        loop {
            log::trace!("Waiting for new command");
            let mut command = [0u8; 4];
            channel
                .command_in
                .read_exact(&mut command)
                .context(ParentGone)?;

            let relay = options
                .relay_fd
                .map(RelayPipe::open)
                .transpose()
                .context(RelaySetupFailed)?;

            hooks.pre_fork();

            log::trace!("Forking new child, iteration {}", iteration);
            let child_pid = unsafe { libc::fork() };
            if child_pid < 0 {
                return Err(io::Error::last_os_error()).context(SpawnFailed);
            }

            if child_pid == 0 {
                // The child must not take part in any further handshake.
                drop(channel);
                if let Some(relay) = relay {
                    relay.into_child();
                }
                hooks.in_child();
                return Ok(Role::Child);
            }

            let relay = relay.map(RelayPipe::into_parent);

            log::trace!("Reporting new child PID: {}", child_pid);
            channel
                .status_out
                .write_i32::<NativeEndian>(child_pid)
                .context(PidWriteFailed)?;
            hooks.after_spawn(child_pid);

            // Collect translation requests until the child dies and the pipe
            // breaks.
            if let Some(reader) = relay {
                let count = tsl::drain_requests(reader, |request| hooks.warm_translation(request));
                log::trace!("Child {} relayed {} translation requests", child_pid, count);
            }

            log::trace!("Waiting for child: {}", child_pid);
            let mut status = 0;
            if unsafe { libc::waitpid(child_pid, &mut status, 0) } < 0 {
                return Err(io::Error::last_os_error()).context(WaitFailed);
            }

            channel
                .status_out
                .write_i32::<NativeEndian>(status)
                .context(StatusWriteFailed)?;
            hooks.iteration_end(status);

            iteration += 1;
            if let Some(pace) = options.pace {
                thread::sleep(pace);
            }
        }
    }
}

pub type Result<T> = result::Result<T, Error>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Fuzzer closed the command channel: {}", source))]
    ParentGone { source: io::Error },
    #[snafu(display("Could not set up translation relay: {}", source))]
    RelaySetupFailed { source: tsl::Error },
    #[snafu(display("Could not spawn new child: {}", source))]
    SpawnFailed { source: io::Error },
    #[snafu(display("Could not send child PID to fuzzer: {}", source))]
    PidWriteFailed { source: io::Error },
    #[snafu(display("Could not wait for child process: {}", source))]
    WaitFailed { source: io::Error },
    #[snafu(display("Could not send child status to fuzzer: {}", source))]
    StatusWriteFailed { source: io::Error },
}

impl Error {
    /// Exit status the process should terminate with.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::ParentGone { .. } => defs::PARENT_GONE_CODE,
            Error::RelaySetupFailed { .. } => defs::RELAY_SETUP_FAILED_CODE,
            Error::SpawnFailed { .. } => defs::FORK_FAILED_CODE,
            Error::PidWriteFailed { .. } => defs::PID_WRITE_FAILED_CODE,
            Error::WaitFailed { .. } => defs::WAIT_FAILED_CODE,
            Error::StatusWriteFailed { .. } => defs::STATUS_WRITE_FAILED_CODE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{pipe::pipe, tsl::RelaySender};
    use byteorder::ReadBytesExt;
    use std::{thread::JoinHandle, time::Instant};

    // Well above anything the test harness opens on its own.
    const TEST_RELAY_FD: RawFd = 200;

    #[derive(Debug, Default)]
    struct Recorder {
        forks: i32,
        spawned: Vec<libc::pid_t>,
        statuses: Vec<i32>,
        requests: Vec<TranslationRequest>,
    }

    impl ForkServerHooks for Recorder {
        fn pre_fork(&mut self) {
            self.forks += 1;
        }

        fn after_spawn(&mut self, child_pid: libc::pid_t) {
            self.spawned.push(child_pid);
        }

        fn warm_translation(&mut self, request: &TranslationRequest) {
            self.requests.push(*request);
        }

        fn iteration_end(&mut self, status: i32) {
            self.statuses.push(status);
        }
    }

    struct Fuzzer {
        command: File,
        status: File,
        server: JoinHandle<(Result<Role>, Recorder)>,
    }

    impl Fuzzer {
        /// Runs the fork server on its own thread. Children run `child` and
        /// exit with the value it returns.
        fn start(options: ForkServerOptions, child: fn(&Recorder) -> i32) -> Self {
            let (command_in, command) = pipe().unwrap();
            let (status, status_out) = pipe().unwrap();

            let server = thread::spawn(move || {
                let mut recorder = Recorder::default();
                let server = ForkServer::new(ForkServerChannel::new(command_in, status_out), options);
                let result = server.run(&mut recorder);
                if let Ok(Role::Child) = result {
                    let code = child(&recorder);
                    unsafe { libc::_exit(code) };
                }
                (result, recorder)
            });

            Self {
                command,
                status,
                server,
            }
        }

        fn read_hello(&mut self) -> [u8; 4] {
            let mut hello = [0u8; 4];
            self.status.read_exact(&mut hello).unwrap();
            hello
        }

        fn run_one(&mut self) -> (libc::pid_t, i32) {
            self.command.write_all(&[8, 8, 8, 8]).unwrap();
            let pid = self.status.read_i32::<NativeEndian>().unwrap();
            let status = self.status.read_i32::<NativeEndian>().unwrap();
            (pid, status)
        }

        fn stop(self) -> (Result<Role>, Recorder, File) {
            drop(self.command);
            let (result, recorder) = self.server.join().unwrap();
            (result, recorder, self.status)
        }
    }

    #[test]
    fn test_reports_pid_then_status() {
        let mut fuzzer = Fuzzer::start(ForkServerOptions::default(), |_| 42);
        assert_eq!(FORKSRV_HELLO, fuzzer.read_hello());

        let (pid, status) = fuzzer.run_one();
        assert!(pid > 0);
        assert!(libc::WIFEXITED(status));
        assert_eq!(42, libc::WEXITSTATUS(status));

        let (result, recorder, mut status_in) = fuzzer.stop();
        assert_eq!(defs::PARENT_GONE_CODE, result.unwrap_err().exit_code());
        assert_eq!(vec![pid], recorder.spawned);
        assert_eq!(vec![status], recorder.statuses);

        // Nothing else was written after the status word.
        let mut rest = Vec::new();
        status_in.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    }

    #[test]
    fn test_one_child_per_command() {
        let mut fuzzer = Fuzzer::start(ForkServerOptions::default(), |recorder| recorder.forks);
        fuzzer.read_hello();

        let (first_pid, first_status) = fuzzer.run_one();
        let (second_pid, second_status) = fuzzer.run_one();
        assert_ne!(first_pid, second_pid);
        assert_eq!(1, libc::WEXITSTATUS(first_status));
        assert_eq!(2, libc::WEXITSTATUS(second_status));

        let (_, recorder, _) = fuzzer.stop();
        assert_eq!(2, recorder.forks);
    }

    #[test]
    fn test_killed_child_status_is_relayed() {
        let mut fuzzer = Fuzzer::start(ForkServerOptions::default(), |_| {
            unsafe { libc::raise(libc::SIGKILL) };
            0
        });
        fuzzer.read_hello();

        let (_, status) = fuzzer.run_one();
        assert!(libc::WIFSIGNALED(status));
        assert_eq!(libc::SIGKILL, libc::WTERMSIG(status));
        fuzzer.stop();
    }

    #[test]
    fn test_parent_gone_before_command() {
        let mut fuzzer = Fuzzer::start(ForkServerOptions::default(), |_| 0);
        fuzzer.read_hello();

        let (result, recorder, _) = fuzzer.stop();
        assert!(matches!(result, Err(Error::ParentGone { .. })));
        assert_eq!(0, recorder.forks);
    }

    fn is_open(fd: RawFd) -> bool {
        unsafe { libc::fcntl(fd, libc::F_GETFD) >= 0 }
    }

    #[test]
    fn test_standalone_without_fuzzer() {
        // Opened read-only, so the hello cannot be written.
        let command_in = File::open("/dev/null").unwrap().into_raw_fd();
        let status_out = File::open("/dev/null").unwrap().into_raw_fd();

        let channel = unsafe { ForkServerChannel::from_raw_fds(command_in, status_out) };
        let server = ForkServer::new(channel, ForkServerOptions::default());
        let mut recorder = Recorder::default();
        assert_eq!(Role::Standalone, server.run(&mut recorder).unwrap());
        assert_eq!(0, recorder.forks);

        // Still open, and still ours to close.
        assert!(is_open(command_in));
        assert!(is_open(status_out));
        unsafe {
            drop(File::from_raw_fd(command_in));
            drop(File::from_raw_fd(status_out));
        }
    }

    #[test]
    fn test_standalone_on_unopened_descriptors() {
        // Nothing in the test harness gets anywhere near these.
        assert!(!is_open(FORKSRV_FD));
        assert!(!is_open(FORKSRV_FD + 1));

        let channel = unsafe { ForkServerChannel::inherited() };
        let server = ForkServer::new(channel, ForkServerOptions::default());
        assert_eq!(Role::Standalone, server.run(&mut ()).unwrap());

        assert!(!is_open(FORKSRV_FD));
        assert!(!is_open(FORKSRV_FD + 1));
    }

    #[test]
    fn test_paced_iterations() {
        let pace = Duration::from_millis(50);
        let options = ForkServerOptions {
            relay_fd: None,
            pace: Some(pace),
        };
        let mut fuzzer = Fuzzer::start(options, |_| 0);
        fuzzer.read_hello();

        // The second command is only read once the pause is over.
        let start = Instant::now();
        fuzzer.run_one();
        let (_, status) = fuzzer.run_one();
        assert!(start.elapsed() >= pace);
        assert_eq!(0, libc::WEXITSTATUS(status));

        let (result, recorder, _) = fuzzer.stop();
        assert!(matches!(result, Err(Error::ParentGone { .. })));
        assert_eq!(2, recorder.forks);
    }

    #[test]
    fn test_relays_translation_requests() {
        let options = ForkServerOptions {
            relay_fd: Some(TEST_RELAY_FD),
            pace: None,
        };
        let mut fuzzer = Fuzzer::start(options, |_| {
            let sender = RelaySender::new(TEST_RELAY_FD);
            sender.send(&TranslationRequest::new(0x1000, 0, 1));
            sender.send(&TranslationRequest::new(0x2000, 0, 2));
            0
        });
        fuzzer.read_hello();

        let (_, status) = fuzzer.run_one();
        assert_eq!(0, libc::WEXITSTATUS(status));

        let (_, recorder, _) = fuzzer.stop();
        assert_eq!(
            vec![
                TranslationRequest::new(0x1000, 0, 1),
                TranslationRequest::new(0x2000, 0, 2),
            ],
            recorder.requests
        );
    }
}
