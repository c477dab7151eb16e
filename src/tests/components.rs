use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use tokio::time::{self, Duration};

use crate::context::Context;
use crate::error::Error;
use crate::lifecycle::{with_start_check, Lifecycle};

pub(crate) mod component_trigger;

/// Creates a component that will block until a close request is given via
/// its cancellation Context.
pub(crate) fn wait_done_component(name: &str) -> Lifecycle {
    Lifecycle::from_interruptible_fn(
        name,
        vec![],
        |_lifecycle, _ctx: Context| async { Ok(()) },
        |_lifecycle, ctx: Context| async move {
            let _ = ctx.done().await;
            Ok(())
        },
    )
}

/// Creates a component that will always fail to start.
pub(crate) fn fail_start_component(name: &str) -> Lifecycle {
    Lifecycle::from_interruptible_fn(
        name,
        vec![],
        |_lifecycle, _ctx: Context| async { Err(Error::from(anyhow!("failing component"))) },
        |_lifecycle, _ctx: Context| async { Ok(()) },
    )
}

/// Creates a component that starts and exits right away with an error.
pub(crate) fn fail_run_component(name: &str) -> Lifecycle {
    Lifecycle::from_interruptible_fn(
        name,
        vec![],
        |_lifecycle, _ctx: Context| async { Ok(()) },
        |_lifecycle, _ctx: Context| async { Err(Error::from(anyhow!("component crashed"))) },
    )
}

/// Creates a component whose start only returns once it is closed.
pub(crate) fn never_start_component(name: &str) -> Lifecycle {
    Lifecycle::from_interruptible_fn(
        name,
        vec![],
        |_lifecycle, ctx: Context| async move {
            let _ = ctx.done().await;
            Err(Error::from(anyhow!("start was cancelled")))
        },
        |_lifecycle, _ctx: Context| async { Ok(()) },
    )
}

/// Creates a component that fails to start every time and counts its
/// attempts.
pub(crate) fn counting_fail_start_component(name: &str) -> (Lifecycle, Arc<AtomicU32>) {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let lifecycle = Lifecycle::from_interruptible_fn(
        name,
        vec![],
        move |_lifecycle, _ctx: Context| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Err(Error::from(anyhow!("start attempt {} failed", attempt))) }
        },
        |_lifecycle, _ctx: Context| async { Ok(()) },
    );
    (lifecycle, attempts)
}

/// Creates a component whose start phase takes `delay` and ignores close
/// requests; its run phase holds until closed.
pub(crate) fn slow_start_component(name: &str, delay: Duration) -> Lifecycle {
    Lifecycle::from_interruptible_fn(
        name,
        vec![],
        move |_lifecycle, _ctx: Context| async move {
            time::sleep(delay).await;
            Ok(())
        },
        |_lifecycle, ctx: Context| async move {
            let _ = ctx.done().await;
            Ok(())
        },
    )
}

/// Creates a component that rejects every start request before entering its
/// start phase.
pub(crate) fn refused_start_component(name: &str) -> Lifecycle {
    Lifecycle::new(
        name,
        vec![with_start_check(|_state| Err(Error::msg("start refused")))],
    )
}
