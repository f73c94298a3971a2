//! Console metronome for the tempo clock
//!
//! Prints one line per beat, accenting downbeats.
//!
//! Usage:
//!   cargo run --bin metronome -- --bpm 96 --signature 3/4 --seconds 8
//!   cargo run --bin metronome -- --ramp 180          # accelerate over the run
//!   cargo run --bin metronome -- --cooperative       # single-threaded clock

use log::info;
use std::env;
use std::thread;
use std::time::Duration;
use tempo_clock::{
    Action, ClockConfig, CooperativeClock, EventInfo, Moment, RealtimeRunner, TempoChange,
    TempoClock, TimeSignature, TimeUnit,
};

struct Options {
    beats_per_minute: f64,
    time_signature: TimeSignature,
    seconds: f64,
    ramp_to: Option<f64>,
    cooperative: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            beats_per_minute: 120.0,
            time_signature: TimeSignature::COMMON,
            seconds: 8.0,
            ramp_to: None,
            cooperative: false,
        }
    }
}

fn print_usage() {
    println!("Console metronome");
    println!();
    println!("Usage: cargo run --bin metronome -- [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -b, --bpm <N>          Tempo in quarter notes per minute (default 120)");
    println!("  -s, --signature <N/D>  Time signature (default 4/4)");
    println!("  -t, --seconds <N>      How long to run (default 8)");
    println!("  -r, --ramp <N>         Step the tempo towards N once per measure");
    println!("  -c, --cooperative      Drive a single-threaded clock instead");
    println!("  -h, --help             Show this message");
}

fn parse_args(args: &[String]) -> Result<Option<Options>, Box<dyn std::error::Error>> {
    let mut options = Options::default();

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1).map(String::as_str);
        match args[i].as_str() {
            "--bpm" | "-b" => {
                options.beats_per_minute = value.ok_or("--bpm needs a value")?.parse()?;
                i += 1;
            }
            "--signature" | "-s" => {
                options.time_signature = value.ok_or("--signature needs a value")?.parse()?;
                i += 1;
            }
            "--seconds" | "-t" => {
                options.seconds = value.ok_or("--seconds needs a value")?.parse()?;
                i += 1;
            }
            "--ramp" | "-r" => {
                options.ramp_to = Some(value.ok_or("--ramp needs a value")?.parse()?);
                i += 1;
            }
            "--cooperative" | "-c" => {
                options.cooperative = true;
            }
            "--help" | "-h" => {
                print_usage();
                return Ok(None);
            }
            other => {
                return Err(format!("Unknown argument {other:?}").into());
            }
        }
        i += 1;
    }
    if !(options.seconds.is_finite() && options.seconds >= 0.0) {
        return Err(format!(
            "--seconds must be finite and non-negative, got {}",
            options.seconds
        )
        .into());
    }
    Ok(Some(options))
}

fn click(current: &Moment, desired: &Moment, info: &EventInfo) {
    let mark = if desired.measure_offset.abs() < 1e-9 { "TICK" } else { "tock" };
    println!(
        "{:>4} | measure {:>3} + {:<6.3} | {:>7.3}s (late {:>6.2}ms) | {:>6.1} BPM {}",
        mark,
        desired.measure,
        desired.measure_offset,
        desired.seconds,
        (current.seconds - desired.seconds) * 1000.0,
        desired.beats_per_minute,
        desired.time_signature,
    );
    if info.invocations == 0 {
        info!("first click from {}", info.id);
    }
}

/// Tempo for the next measure when ramping from `from` to `to` over `measures`.
fn ramp_step(from: f64, to: f64, measures: f64, measure: i64) -> f64 {
    let t = ((measure - 1) as f64 / measures.max(1.0)).min(1.0);
    from + (to - from) * t
}

fn run_threaded(options: &Options) -> Result<(), Box<dyn std::error::Error>> {
    let clock = TempoClock::new(ClockConfig {
        beats_per_minute: options.beats_per_minute,
        time_signature: options.time_signature,
        ..Default::default()
    })?;
    let beat = 1.0 / f64::from(options.time_signature.denominator());

    clock.schedule(
        move |current: &Moment, desired: &Moment, info: &EventInfo| {
            click(current, desired, info);
            Ok(Action::after_beats(beat))
        },
        0.0,
        TimeUnit::Beats,
    )?;

    if let Some(to) = options.ramp_to {
        let from = options.beats_per_minute;
        let measures = options.seconds * from / 240.0 / options.time_signature.measure_length();
        let handle = clock.handle();
        clock.schedule(
            move |_: &Moment, desired: &Moment, _: &EventInfo| {
                handle.schedule_change(
                    TempoChange::tempo(ramp_step(from, to, measures, desired.measure + 1)),
                    desired.measure as f64 + 1.0,
                    TimeUnit::Measures,
                )?;
                Ok(Action::after_measures(1.0))
            },
            1.0,
            TimeUnit::Measures,
        )?;
    }

    clock.start()?;
    thread::sleep(Duration::from_secs_f64(options.seconds));
    clock.stop();
    Ok(())
}

fn run_cooperative(options: &Options) -> Result<(), Box<dyn std::error::Error>> {
    let clock = CooperativeClock::new(ClockConfig {
        beats_per_minute: options.beats_per_minute,
        time_signature: options.time_signature,
        ..Default::default()
    })?;
    let beat = 1.0 / f64::from(options.time_signature.denominator());

    clock.schedule(
        move |current: &Moment, desired: &Moment, info: &EventInfo| {
            click(current, desired, info);
            Ok(Action::after_beats(beat))
        },
        0.0,
        TimeUnit::Beats,
    )?;

    if let Some(to) = options.ramp_to {
        let from = options.beats_per_minute;
        let measures = options.seconds * from / 240.0 / options.time_signature.measure_length();
        let inner = clock.clone();
        clock.schedule(
            move |_: &Moment, desired: &Moment, _: &EventInfo| {
                inner.schedule_change(
                    TempoChange::tempo(ramp_step(from, to, measures, desired.measure + 1)),
                    desired.measure as f64 + 1.0,
                    TimeUnit::Measures,
                )?;
                Ok(Action::after_measures(1.0))
            },
            1.0,
            TimeUnit::Measures,
        )?;
    }

    clock.start()?;
    let mut runner = RealtimeRunner::with_clock(clock);
    runner.run_for(options.seconds);
    runner.clock().stop();
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    let Some(options) = parse_args(&args)? else {
        return Ok(());
    };

    println!(
        "Metronome: {} BPM in {} for {}s{}",
        options.beats_per_minute,
        options.time_signature,
        options.seconds,
        if options.cooperative { " (cooperative)" } else { "" }
    );
    println!("------------------------------");

    if options.cooperative {
        run_cooperative(&options)?;
    } else {
        run_threaded(&options)?;
    }

    println!("\nDone.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Option<Options>, Box<dyn std::error::Error>> {
        let args: Vec<String> = std::iter::once("metronome")
            .chain(args.iter().copied())
            .map(String::from)
            .collect();
        parse_args(&args)
    }

    #[test]
    fn test_parse_options() {
        let options = parse(&["--bpm", "96", "-s", "3/4", "--seconds", "2.5", "-c"])
            .unwrap()
            .unwrap();
        assert_eq!(options.beats_per_minute, 96.0);
        assert_eq!(options.time_signature, TimeSignature::new(3, 4).unwrap());
        assert_eq!(options.seconds, 2.5);
        assert!(options.cooperative);
        assert!(parse(&["--help"]).unwrap().is_none());
    }

    #[test]
    fn test_rejects_unbounded_run_time() {
        assert!(parse(&["--seconds", "inf"]).is_err());
        assert!(parse(&["--seconds", "NaN"]).is_err());
        assert!(parse(&["--seconds", "-1"]).is_err());
        assert!(parse(&["--seconds"]).is_err());
        assert!(parse(&["--tempo", "90"]).is_err());
    }
}
