use crate::{
    context, coverage,
    setup::{self, InstrumentationContext, TargetLayout},
};

use afl_shim_common::{
    fork_server::{self, ForkServer, ForkServerChannel, ForkServerHooks, Role},
    tsl::{RelaySender, TranslationRequest},
};
use once_cell::sync::OnceCell;
use snafu::{ResultExt, Snafu};
use std::{
    result,
    sync::atomic::{AtomicBool, Ordering},
};

/// The parts of the execution engine the shim calls back into.
pub trait Engine {
    /// Keeps the engine's own fork handlers from running in forked children.
    fn suppress_atfork(&mut self) {}
    /// Looks up the translation for `request`, generating and caching it if
    /// it is missing, so that the next child inherits it.
    fn warm_translation(&mut self, _request: &TranslationRequest) {}
}

impl Engine for () {}

/// Glue between the engine hooks, the coverage map and the fork server.
#[derive(Debug)]
pub struct Shim {
    layout: TargetLayout,
    context: OnceCell<InstrumentationContext>,
    fork_child: AtomicBool,
}

impl Shim {
    pub fn new(layout: TargetLayout) -> Self {
        Self {
            layout,
            context: OnceCell::new(),
            fork_child: AtomicBool::new(false),
        }
    }

    pub fn context(&self) -> Option<&InstrumentationContext> {
        self.context.get()
    }

    /// Whether this process was spawned by the fork server.
    pub fn is_fork_child(&self) -> bool {
        self.fork_child.load(Ordering::Relaxed)
    }

    /// Called by the engine before executing the block at `address`.
    ///
    /// Reaching the entry point for the first time sets the instrumentation
    /// up from the environment and hands control to the fork server, which
    /// only returns in children or when running standalone.
    #[inline]
    pub fn on_block_entry<E: Engine>(&self, address: u64, engine: &mut E) -> Result<()> {
        if address == self.layout.entry_point && self.context.get().is_none() {
            let context = InstrumentationContext::from_env(&self.layout).context(SetupFailed)?;
            // Safe: only the fuzzer hands out the fork server descriptors, and
            // they are released unclosed if it turns out not to be there.
            self.start(context, engine, || unsafe { ForkServerChannel::inherited() })?;
        }

        if let Some(context) = self.context.get() {
            coverage::log_block(context, address);
        }

        Ok(())
    }

    /// Installs `context` and, if a coverage map is attached, runs the fork
    /// server on the channel built by `channel`.
    pub fn start<E, C>(
        &self,
        context: InstrumentationContext,
        engine: &mut E,
        channel: C,
    ) -> Result<Role>
    where
        E: Engine,
        C: FnOnce() -> ForkServerChannel,
    {
        let mut installed = false;
        let context = self.context.get_or_init(|| {
            installed = true;
            context
        });
        if !installed {
            return AlreadyStarted.fail();
        }

        engine.suppress_atfork();

        if !context.bitmap.is_attached() {
            log::debug!("No coverage map, running without fork server");
            return Ok(Role::Standalone);
        }

        let mut hooks = ShimHooks {
            engine,
            fork_child: &self.fork_child,
        };
        let role = ForkServer::new(channel(), context.fork_server.clone())
            .run(&mut hooks)
            .context(ForkServerFailed)?;

        if role == Role::Standalone {
            log::debug!("Running standalone");
        }
        Ok(role)
    }

    /// Called by the engine when it has to translate a block. Only forked
    /// children relay the request, and only when the relay is enabled.
    pub fn on_missing_translation(&self, pc: u64, cs_base: u64, flags: u64) {
        if !self.is_fork_child() {
            return;
        }

        let relay_fd = match self.context.get().and_then(|context| context.fork_server.relay_fd) {
            Some(relay_fd) => relay_fd,
            None => return,
        };

        RelaySender::new(relay_fd).send(&TranslationRequest::new(pc, cs_base, flags));
    }
}

struct ShimHooks<'a, E> {
    engine: &'a mut E,
    fork_child: &'a AtomicBool,
}

impl<'a, E: Engine> ForkServerHooks for ShimHooks<'a, E> {
    fn in_child(&mut self) {
        context::reset_edge_state();
        self.fork_child.store(true, Ordering::Relaxed);
    }

    fn warm_translation(&mut self, request: &TranslationRequest) {
        self.engine.warm_translation(request);
    }
}

pub type Result<T> = result::Result<T, Error>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Could not set up instrumentation: {}", source))]
    SetupFailed { source: setup::Error },
    #[snafu(display("Instrumentation was already set up"))]
    AlreadyStarted,
    #[snafu(display("Error in fork server: {}", source))]
    ForkServerFailed { source: fork_server::Error },
}

impl Error {
    /// Exit status the process should terminate with.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::SetupFailed { source } => source.exit_code(),
            Error::AlreadyStarted => afl_shim_common::defs::SETUP_FAILED_CODE,
            Error::ForkServerFailed { source } => source.exit_code(),
        }
    }

    /// The fuzzer went away, this is how a fork server normally ends.
    pub fn is_parent_gone(&self) -> bool {
        matches!(
            self,
            Error::ForkServerFailed {
                source: fork_server::Error::ParentGone { .. }
            }
        )
    }
}
