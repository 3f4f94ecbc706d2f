use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::Result;
use chronon::config::ClockTreeConfig;
use chronon::ports::{DataInPort, DataOutPort, Port};
use chronon::{bind, ClockManager, Event, EventSet, Scheduler, SchedulingPhase, TreeNode};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use uuid::Uuid;

#[derive(Parser)]
struct Args {
    #[clap(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Build the demo producer/consumer pipeline and run it
    Run {
        /// Path to a clock tree config JSON file (default: a lone root clock)
        #[clap(long)]
        clocks: Option<String>,
        /// Tick budget for the run
        #[clap(long, default_value_t = 100_000u64)]
        ticks: u64,
        /// RNG seed for the traffic pattern
        #[clap(long, default_value_t = 42u64)]
        seed: u64,
        /// Where to write the JSON run report
        #[clap(long)]
        report: Option<PathBuf>,
    },
}

#[derive(Serialize)]
struct RunReport {
    run_id: String,
    started_at: String,
    seed: u64,
    ticks_elapsed: u64,
    events_fired: u64,
    values_sent: u64,
    values_received: u64,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    match args.command {
        Command::Run {
            clocks,
            ticks,
            seed,
            report,
        } => run_command(clocks.as_deref(), ticks, seed, report.as_deref())?,
    }
    Ok(())
}

fn run_command(
    clock_config: Option<&str>,
    ticks: u64,
    seed: u64,
    report_path: Option<&Path>,
) -> Result<()> {
    let started_at = chrono::Utc::now().to_rfc3339();
    println!(
        "chrononctl: running demo pipeline (ticks={}, seed={})",
        ticks, seed
    );

    let scheduler = Scheduler::new("chronon");
    let manager = ClockManager::new(&scheduler);
    if let Some(path) = clock_config {
        let config = ClockTreeConfig::load_from_json(Path::new(path))?;
        config.build(&manager)?;
    } else {
        manager.make_root("root")?;
    }
    manager.normalize()?;
    let root_clock = manager.root().expect("root clock was just created");

    // Two units on one clock: a producer pushing seeded random values
    // through a one-cycle data port into a counting consumer.
    let top = TreeNode::new_root("top");
    top.set_clock(&root_clock);
    let producer = top.add_child("producer")?;
    let consumer = top.add_child("consumer")?;

    let out_port = DataOutPort::<u64>::new(&producer.port_set(), "out_data")?;
    let in_port = DataInPort::<u64>::new(&consumer.port_set(), "in_data", 1)?;
    bind(
        &(Rc::clone(&out_port) as Rc<dyn Port>),
        &(Rc::clone(&in_port) as Rc<dyn Port>),
    )?;

    let received = Rc::new(Cell::new(0u64));
    let received_sum = Rc::new(Cell::new(0u64));
    in_port.register_consumer_handler({
        let received = Rc::clone(&received);
        let received_sum = Rc::clone(&received_sum);
        move |value: &u64| {
            received.set(received.get() + 1);
            received_sum.set(received_sum.get() + *value);
            Ok(())
        }
    })?;

    let events = EventSet::new(&producer)?;
    let sent = Rc::new(Cell::new(0u64));
    let produce_event: Rc<RefCell<Option<Event>>> = Rc::new(RefCell::new(None));
    let mut rng = StdRng::seed_from_u64(seed);
    let event = Event::new(&events, "produce", SchedulingPhase::Tick, {
        let out_port = Rc::clone(&out_port);
        let sent = Rc::clone(&sent);
        let produce_event = Rc::clone(&produce_event);
        move || {
            out_port.send(rng.gen_range(1..=1000u64))?;
            sent.set(sent.get() + 1);
            let gap = rng.gen_range(1..=3u64);
            if let Some(event) = produce_event.borrow().as_ref() {
                event.schedule_in(gap)?;
            }
            Ok(())
        }
    })?;
    *produce_event.borrow_mut() = Some(event.clone());

    scheduler.finalize()?;
    event.schedule_in(1)?;
    scheduler.run(Some(ticks), true)?;

    println!(
        "Run complete: {} ticks, {} events fired, {} values sent, {} received (sum {})",
        scheduler.current_tick(),
        scheduler.events_fired(),
        sent.get(),
        received.get(),
        received_sum.get()
    );

    if let Some(path) = report_path {
        let report = RunReport {
            run_id: Uuid::new_v4().to_string(),
            started_at,
            seed,
            ticks_elapsed: scheduler.current_tick(),
            events_fired: scheduler.events_fired(),
            values_sent: sent.get(),
            values_received: received.get(),
        };
        std::fs::write(path, serde_json::to_string_pretty(&report)?)?;
        println!("Run report written to: {}", path.display());
    }
    Ok(())
}
