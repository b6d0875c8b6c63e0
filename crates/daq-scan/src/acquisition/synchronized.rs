//! One finite frame per trigger barrier.
//!
//! Every detector that carries a software trigger must have fired before the
//! frame starts. Fires are only consumed once all of them are present, so a
//! restart while waiting loses nothing.

use tracing::{debug, info, warn};

use crate::detector::{RunMode, SoftwareTrigger};
use crate::error::{Result, ScanError};
use crate::settings::AcquisitionSettings;

use super::assembler::FrameAssembler;
use super::tasks::RunTasks;
use super::{Control, RunContext, RunOutcome};

pub(crate) fn run(ctx: &mut RunContext<'_>, settings: &AcquisitionSettings) -> Result<RunOutcome> {
    if let Some(outcome) = wait_for_triggers(ctx, settings) {
        return Ok(outcome);
    }

    let mut tasks = RunTasks::open(
        ctx.hardware,
        settings,
        ctx.config,
        ctx.counters,
        ctx.output_range,
    )?;
    let mut assembler = FrameAssembler::new(settings, ctx.pools, RunMode::Synchronized)?;

    let result = acquire_frame(ctx, settings, &mut tasks, &mut assembler);

    tasks.stop_all();
    assembler.release(ctx.pools);
    result
}

/// Block until every trigger has fired. Returns early if the queue says so.
fn wait_for_triggers(
    ctx: &mut RunContext<'_>,
    settings: &AcquisitionSettings,
) -> Option<RunOutcome> {
    let triggers: Vec<&SoftwareTrigger> = settings
        .analog_detectors
        .iter()
        .chain(settings.counting_detectors.iter())
        .filter_map(|d| d.trigger())
        .collect();
    if triggers.is_empty() {
        return None;
    }

    loop {
        match triggers.iter().find(|t| t.pending() == 0) {
            None => break,
            Some(missing) => {
                if missing.wait_fired(ctx.config.barrier_poll) {
                    continue;
                }
            }
        }
        match ctx.inbox.poll() {
            Control::Continue => {}
            Control::Update => return Some(RunOutcome::Restart),
            Control::Stop => return Some(RunOutcome::Stop),
            Control::Terminate => return Some(RunOutcome::Terminate),
        }
    }

    for trigger in &triggers {
        trigger.wait_timeout(std::time::Duration::ZERO);
    }
    debug!(triggers = triggers.len(), "Trigger barrier released");
    None
}

fn acquire_frame(
    ctx: &mut RunContext<'_>,
    settings: &AcquisitionSettings,
    tasks: &mut RunTasks,
    assembler: &mut FrameAssembler,
) -> Result<RunOutcome> {
    tasks.start()?;

    let input = settings.chunks.input;
    let timeout = tasks.io_timeout();
    let mut read = 0;
    while read < input.total {
        let got = assembler.read_chunk(tasks, input.chunk.min(input.total - read), timeout)?;
        if got == 0 {
            return Err(ScanError::hardware(format!(
                "finite input ended after {} of {} samples",
                read, input.total
            )));
        }
        read += got;

        match ctx.inbox.poll() {
            // Picked up by the next run; finish the frame first
            Control::Continue | Control::Update => {}
            Control::Stop => return Ok(RunOutcome::Stop),
            Control::Terminate => return Ok(RunOutcome::Terminate),
        }
    }

    let delivered = assembler.deliver_ready(ctx.sequence, ctx.counters);
    if delivered == 0 {
        warn!(samples = read, "Synchronized run completed without a frame");
    }
    info!(sequence = ctx.sequence.saturating_sub(1), "Synchronized frame acquired");
    Ok(RunOutcome::Restart)
}
