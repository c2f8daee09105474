// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The driving binary (§4.9, §6): owns argument parsing, logging setup, and
//! the `init` / `enqueue` / `start` / `wait` / `fini` process lifecycle.
//!
//! Grounded on the teacher kernel's `startup::safe_start_kernel` call site
//! in its own `demo` binary: a thin `main` that builds the fixed records and
//! hands control to the run loop, with no business logic of its own. Unlike
//! the teacher, this binary is not itself the thing that ships a real task
//! graph -- the PTG-to-code translator that would generate one is out of
//! scope (§1) -- so it runs a minimal, self-contained startup graph (the
//! shape of scenario S1, §8) purely to demonstrate the lifecycle end to end.
//! A real deployment links a translator-generated `client` call site in
//! place of [`smoke_test_handle`].

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use abi::{FlowIndex, Rank, TaskClassId};
use client::TaskClassBuilder;
use engine::taskclass::{locals_as_bytes_produce, FlowKind};
use engine::{Context, ContextConfig, Handle};

fn main() -> ExitCode {
    install_tracing();

    let config = ContextConfig::parse();
    let mut ctx = match Context::init(config) {
        Ok(ctx) => ctx,
        Err(err) => {
            eprintln!("ptg-engine: init failed: {err}");
            return ExitCode::FAILURE;
        }
    };

    let handle = smoke_test_handle();
    if let Err(err) = client::submit(&ctx, Arc::clone(&handle)) {
        eprintln!("ptg-engine: failed to submit startup graph: {err}");
        return ExitCode::FAILURE;
    }
    if let Err(err) = ctx.start(Arc::clone(&handle)) {
        eprintln!("ptg-engine: failed to start workers: {err}");
        return ExitCode::FAILURE;
    }

    // §4.9 step 4: "the current thread becomes worker 0 of VP 0." Run it on
    // a scoped thread so the main thread is free to call `wait`, which polls
    // the handle's remaining-task counter rather than blocking on a thread
    // join.
    std::thread::scope(|scope| {
        scope.spawn(|| ctx.run_inline());
        ctx.wait(&handle);
    });

    ctx.fini();
    ExitCode::SUCCESS
}

/// §10.3: `cli` is the only crate in this workspace that installs a
/// `tracing-subscriber`; `engine` and `client` only ever emit events/spans.
fn install_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

/// A single-class, zero-parameter, write-only startup graph -- the literal
/// shape of scenario S1 (§8): one task, one node, no inputs, no network
/// activity. Stands in for whatever a real PTG translator would generate.
fn smoke_test_handle() -> Arc<Handle> {
    let class = TaskClassBuilder::new(TaskClassId(0), "smoke_test")
        .flow("out", FlowKind::Write, Vec::new(), Vec::new())
        .hook(|_locals, _input_lens| {
            tracing::info!("smoke_test task executed");
            0
        })
        .data_affinity(|_params| Rank(0))
        .produce(locals_as_bytes_produce(vec![FlowIndex(0)]))
        .build()
        .expect("built-in smoke-test class is well-formed");

    client::HandleBuilder::new().class(class).build()
}
