//! Free-running acquisition.
//!
//! Outputs loop over the frame (regenerated or refilled), inputs stream
//! chunk after chunk and completed frames are pushed as they appear. A
//! settings update is applied on the next frame boundary; a stop abandons
//! the frame in flight.

use tracing::{debug, info};

use crate::detector::RunMode;
use crate::error::{Result, ScanError};
use crate::settings::AcquisitionSettings;

use super::assembler::FrameAssembler;
use super::tasks::RunTasks;
use super::{Control, RunContext, RunOutcome};

pub(crate) fn run(ctx: &mut RunContext<'_>, settings: &AcquisitionSettings) -> Result<RunOutcome> {
    let mut tasks = RunTasks::open(
        ctx.hardware,
        settings,
        ctx.config,
        ctx.counters,
        ctx.output_range,
    )?;
    let mut assembler = FrameAssembler::new(settings, ctx.pools, RunMode::Continuous)?;

    let result = stream(ctx, settings, &mut tasks, &mut assembler);

    tasks.stop_all();
    assembler.release(ctx.pools);
    result
}

fn stream(
    ctx: &mut RunContext<'_>,
    settings: &AcquisitionSettings,
    tasks: &mut RunTasks,
    assembler: &mut FrameAssembler,
) -> Result<RunOutcome> {
    tasks.start()?;
    info!(
        width = settings.resolution[0],
        height = settings.resolution[1],
        dwell = settings.dwell_time(),
        ai_osr = settings.timing.ai_osr,
        "Continuous acquisition running"
    );

    let chunk = settings.chunks.input.chunk;
    let timeout = tasks.io_timeout();
    let mut update_pending = false;
    loop {
        let got = assembler.read_chunk(tasks, chunk, timeout)?;
        if got == 0 {
            return Err(ScanError::hardware("continuous input returned no samples"));
        }
        assembler.deliver_ready(ctx.sequence, ctx.counters);

        match ctx.inbox.poll() {
            Control::Continue => {}
            Control::Update => update_pending = true,
            Control::Stop => {
                debug!("Continuous acquisition stopped");
                return Ok(RunOutcome::Stop);
            }
            Control::Terminate => return Ok(RunOutcome::Terminate),
        }
        if update_pending && assembler.at_frame_boundary() {
            debug!("Restarting continuous acquisition with new settings");
            return Ok(RunOutcome::Restart);
        }
    }
}
