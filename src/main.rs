#![warn(clippy::unwrap_used, clippy::pedantic)]
#![allow(
    clippy::cast_lossless,
    clippy::cast_possible_truncation,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::module_name_repetitions,
    clippy::too_many_lines,
    clippy::doc_markdown
)]
use std::{
    cell::RefCell,
    collections::BTreeMap,
    path::Path,
    rc::Rc,
    sync::Arc,
    time::{Duration, Instant},
};

use color_eyre::eyre;
use config::Config;
use orrery::{
    bodies::BodyRegistry,
    catalog,
    channel::{Flush, TraceChannel, TraceId},
    frames,
    kepler::{elements_from_state, propagate_universal},
    session::Simulation,
    soi::TrajectorySample,
    state::SystemSnapshot,
    time::UT,
    trajectory::{PatchedConicTracer, Trace, TraceConfig, TracePoint},
};
use serde::Serialize;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

/// Longest wait for outstanding traces once the ticks are done.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct SessionDump {
    snapshot: SystemSnapshot,
    traces: BTreeMap<TraceId, Trace>,
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let config = match std::env::args_os().nth(1) {
        Some(path) => Config::load(Path::new(&path))?,
        None => Config::default(),
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();

    let catalog = match &config.catalog {
        Some(path) => catalog::load(path)?,
        None => catalog::default_catalog()?,
    };
    let start = match &config.epoch {
        Some(epoch) => UT::from_calendar(epoch)?,
        None => catalog.epoch()?,
    };
    let registry = Arc::new(catalog.into_registry()?);
    info!(bodies = registry.len(), %start, "loaded catalog");

    let mut sim = Simulation::new(registry.clone(), start);
    sim.clock_mut().set_time_warp(config.time_warp)?;

    let tracer = PatchedConicTracer::new(registry.clone(), config.trace.clone());
    let mut channel = TraceChannel::spawn(tracer.clone(), config.mailbox)?;
    let latest: Rc<RefCell<BTreeMap<TraceId, Trace>>> = Rc::default();
    let mut craft = Vec::with_capacity(config.craft.len());
    for entry in &config.craft {
        registry.body(entry.central)?;
        let id = entry.id;
        let label = entry.label();
        let sink = latest.clone();
        channel.register(id, move |trace: &Trace| {
            for transition in &trace.transitions {
                info!(
                    craft = %label,
                    from = %transition.from_body,
                    to = %transition.to_body,
                    time = %transition.time,
                    "predicted SOI transition"
                );
            }
            sink.borrow_mut().insert(id, trace.clone());
        });
        craft.push((id, entry.point(start)));
    }

    let mut snapshot = sim.snapshot()?;
    for tick in 0..config.ticks {
        snapshot = sim.tick(config.tick_seconds)?;
        for (id, point) in &mut craft {
            if let Err(error) = advance(&registry, &tracer, *id, point, snapshot.time) {
                warn!(craft = %id, %error, "could not advance craft");
                continue;
            }
            channel.queue_update(*id, *point);
        }
        if let Flush::Deferred(pending) = channel.flush()? {
            debug!(tick, pending, "worker busy, updates roll into the next tick");
        }
        channel.dispatch()?;
    }

    let deadline = Instant::now() + DRAIN_TIMEOUT;
    while (channel.in_flight() > 0 || channel.pending_len() > 0) && Instant::now() < deadline {
        if channel.pending_len() > 0 {
            channel.flush()?;
        }
        channel.dispatch_timeout(Duration::from_millis(100))?;
    }
    if channel.in_flight() > 0 {
        warn!(in_flight = channel.in_flight(), "gave up waiting for traces");
    }

    for (id, error) in &snapshot.skipped {
        warn!(body = %id, %error, "body unresolved at end of session");
    }
    for (id, point) in &craft {
        let mu = registry.body(point.central_body)?.gm;
        match elements_from_state(point.position, point.velocity, mu, point.time, 1e-8) {
            Ok(elements) => info!(
                craft = %id,
                central = %point.central_body,
                a = elements.a,
                e = elements.e,
                i = elements.i.to_degrees(),
                "final osculating orbit"
            ),
            Err(error) => info!(craft = %id, %error, "no closed osculating orbit"),
        }
    }

    if let Some(path) = &config.output {
        let mut traces = latest.borrow().clone();
        let snapshot = if config.render_frame {
            for trace in traces.values_mut() {
                trace.samples.iter_mut().for_each(sample_to_render);
            }
            snapshot.to_render()
        } else {
            snapshot
        };
        let dump = SessionDump { snapshot, traces };
        std::fs::write(
            path,
            ron::ser::to_string_pretty(
                &dump,
                ron::ser::PrettyConfig::default().struct_names(true),
            )?,
        )?;
        info!(path = %path.display(), "wrote final state");
    }
    Ok(())
}

/// Coast `point` on its two-body arc up to `time`, then move it to the body
/// whose sphere of influence it is in.
fn advance(
    registry: &BodyRegistry,
    tracer: &PatchedConicTracer,
    id: TraceId,
    point: &mut TracePoint,
    time: UT,
) -> eyre::Result<()> {
    let dt = (time - point.time).as_seconds_f64();
    if dt <= 0.0 {
        return Ok(());
    }
    let TraceConfig { tol, maxiter, .. } = *tracer.config();
    let mu = registry.body(point.central_body)?.gm;
    let (position, velocity) =
        propagate_universal(point.position, point.velocity, mu, dt, tol, maxiter)?;
    let coasted = TracePoint {
        time,
        position,
        velocity,
        ..*point
    };
    *point = tracer.recenter(&coasted)?;
    if point.central_body != coasted.central_body {
        info!(
            craft = %id,
            from = %coasted.central_body,
            to = %point.central_body,
            %time,
            "craft changed sphere of influence"
        );
    }
    Ok(())
}

fn sample_to_render(sample: &mut TrajectorySample) {
    sample.position = frames::to_render(sample.position);
    sample.velocity = frames::to_render(sample.velocity);
}
