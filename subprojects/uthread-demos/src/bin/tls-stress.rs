//! Thread-local storage under pressure: clones, copy-on-write and an
//! isolation kill.
//!
//! Usage: `tls-stress [ROUNDS]`

use std::{process::ExitCode, ptr};

use uthread_demos::{DemoError, exit_value, join_all, logger, runtime_from_env};
use uthread_rt::{ExitStatus, Runtime, ThreadId};
use uthread_sys_mem::alignment::page_size;

const CLONERS: usize = 4;
const DEFAULT_ROUNDS: usize = 16;

const REGION_PAGES: usize = 3;
const BANNER: &[u8] = b"uthread tls";

/// Where each cloner writes its own id: the first byte of the last page, so
/// the banner page stays shared.
fn slot_offset() -> usize {
    (REGION_PAGES - 1) * page_size()
}

fn main() -> ExitCode {
    if let Err(err) = logger::init() {
        eprintln!("logger setup failed: {err}");
    }

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), DemoError> {
    let rounds = match std::env::args().nth(1) {
        Some(arg) => arg
            .parse()
            .map_err(|err| DemoError::Check(format!("invalid round count {arg:?}: {err}")))?,
        None => DEFAULT_ROUNDS,
    };

    let rt = runtime_from_env()?;

    for round in 0..rounds {
        clone_round(&rt, round)?;
    }
    isolation(&rt)?;

    println!("{rounds} clone rounds of {CLONERS} threads and one isolation kill passed");
    Ok(())
}

/// Thread 0 builds a region, several threads clone it and write their own
/// copy, and nobody sees anyone else's writes.
fn clone_round(rt: &Runtime, round: usize) -> Result<(), DemoError> {
    rt.tls_create(REGION_PAGES * page_size())?;
    rt.tls_write(0, BANNER)?;

    let mut cloners = Vec::with_capacity(CLONERS);
    for n in 0..CLONERS {
        cloners.push(rt.spawn(move |rt| exit_value(rt, clone_and_write(rt, round, n)))?);
    }
    join_all(rt, cloners)?;

    let mut slot = [0u8; 8];
    rt.tls_read(slot_offset(), &mut slot)?;
    if slot != [0; 8] {
        return Err(DemoError::Check(format!("a clone's write leaked into thread 0: {slot:?}")));
    }

    rt.tls_destroy()?;
    Ok(())
}

fn clone_and_write(rt: &Runtime, round: usize, n: usize) -> Result<(), DemoError> {
    rt.tls_clone(ThreadId::MAIN)?;

    let mut banner = [0u8; BANNER.len()];
    rt.tls_read(0, &mut banner)?;
    if banner[..] != *BANNER {
        return Err(DemoError::Check(format!("clone read {banner:?}")));
    }

    let mine = ((round << 8) | n) as u64;
    rt.tls_write(slot_offset(), &mine.to_ne_bytes())?;
    rt.yield_now();

    let mut slot = [0u8; 8];
    rt.tls_read(slot_offset(), &mut slot)?;
    if u64::from_ne_bytes(slot) != mine {
        return Err(DemoError::Check(format!("clone {n} lost its write")));
    }

    let shared = rt.tls_page_addresses(ThreadId::MAIN).unwrap_or_default();
    let own = rt.tls_page_addresses(rt.current()).unwrap_or_default();
    let still_shared = shared.iter().zip(&own).filter(|(a, b)| a == b).count();
    log::debug!("clone {n} shares {still_shared} of {} pages with thread 0", own.len());

    // Half the clones clean up themselves, the join releases the others.
    if n % 2 == 0 {
        rt.tls_destroy()?;
    }
    Ok(())
}

/// A thread reading another thread's page directly is terminated.
fn isolation(rt: &Runtime) -> Result<(), DemoError> {
    rt.tls_create(BANNER.len())?;
    rt.tls_write(0, BANNER)?;

    let target = rt
        .tls_page_addresses(ThreadId::MAIN)
        .and_then(|pages| pages.first().copied())
        .ok_or_else(|| DemoError::Check("thread 0 has no region".to_owned()))?;

    let intruder = rt.spawn(move |_| {
        // SAFETY: None; the page is inaccessible and this read faults.
        let byte = unsafe { ptr::read_volatile(target as *const u8) };
        usize::from(byte)
    })?;

    match rt.join(intruder)? {
        ExitStatus::Faulted { address } if address == target => {
            log::info!("intruder {intruder} was terminated at {address:#x}");
        }
        other => return Err(DemoError::Check(format!("intruder finished with {other:?}"))),
    }

    rt.tls_destroy()?;
    Ok(())
}
