#![allow(dead_code)]

use lifecycle::prelude::*;

pub fn wait_done_component(name: &str) -> Lifecycle {
    Lifecycle::from_interruptible_fn(
        name,
        vec![],
        |_lifecycle, _ctx: Context| async { Ok(()) },
        |_lifecycle, ctx: Context| async move {
            // wait for the component to be closed
            let _ = ctx.done().await;
            Ok(())
        },
    )
}

pub fn start_err_component(name: &str, err_msg: &'static str) -> Lifecycle {
    Lifecycle::from_interruptible_fn(
        name,
        vec![],
        move |_lifecycle, _ctx: Context| async move { Err(Error::msg(err_msg)) },
        |_lifecycle, _ctx: Context| async { Ok(()) },
    )
}
