// UWB TDoA tag - demo entry point
//
// Runs the tag driver against a simulated anchor mesh and reports how the
// emitted distance differences compare to the true geometry.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use clap::Parser;
use nalgebra::Point3;
use tracing::{info, warn};

use uwb_tdoa_tag::config::Config;
use uwb_tdoa_tag::constants::NR_OF_TDOA2_ANCHORS;
use uwb_tdoa_tag::driver::{Estimator, HeightMeasurement, TagDriver, TagDriverConfig};
use uwb_tdoa_tag::engine::{MatchingAlgorithm, TdoaMeasurement};
use uwb_tdoa_tag::sim::{AnchorLayout, SimConfig, SimulatedMesh};

/// Stand-in for the state estimator: collects everything it is handed.
#[derive(Clone, Default)]
struct QueueingEstimator {
    measurements: Rc<RefCell<Vec<TdoaMeasurement>>>,
    height_count: Rc<RefCell<usize>>,
}

impl Estimator for QueueingEstimator {
    fn enqueue_tdoa(&mut self, measurement: &TdoaMeasurement) {
        self.measurements.borrow_mut().push(measurement.clone());
    }

    fn enqueue_absolute_height(&mut self, _measurement: &HeightMeasurement) {
        *self.height_count.borrow_mut() += 1;
    }
}

#[derive(serde::Serialize)]
struct MeasurementRecord {
    anchor_ids: [u8; 2],
    distance_diff: f64,
    expected: f64,
    std_dev: f32,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();
    init_logging(config.verbose);

    info!("Starting UWB TDoA tag simulation");

    let layout = match &config.layout {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => AnchorLayout::default(),
    };
    if layout.anchors.len() != NR_OF_TDOA2_ANCHORS {
        warn!(
            "layout has {} anchors, TDoA2 addresses {}",
            layout.anchors.len(),
            NR_OF_TDOA2_ANCHORS
        );
    }

    let tag_position = parse_tag_position(&config.tag_position)?;
    let matching_algorithm = match config.matching.as_str() {
        "random" => MatchingAlgorithm::Random,
        "youngest" => MatchingAlgorithm::Youngest,
        other => return Err(format!("unknown matching algorithm '{}'", other).into()),
    };

    let sim_config = SimConfig {
        tag_position,
        packet_loss: config.packet_loss,
        rx_jitter_std_ticks: config.rx_jitter,
        ..SimConfig::default()
    };
    let mut mesh = SimulatedMesh::new(sim_config, &layout, config.seed);

    let estimator = QueueingEstimator::default();
    let driver_config = TagDriverConfig {
        matching_algorithm,
        fixed_height: config.fixed_height,
        ..TagDriverConfig::default()
    };
    let mut driver = TagDriver::new(driver_config, Box::new(estimator.clone()), 0);
    if let Some(stddev) = config.stddev {
        driver.set_std_dev(stddev);
    }
    driver.init(&mut mesh);

    info!(
        events = config.events,
        matching = %config.matching,
        seed = config.seed,
        "running"
    );

    for _ in 0..config.events {
        let event = mesh.advance();
        let now_ms = mesh.now_ms();
        driver.on_event(&mut mesh, event, now_ms);
    }

    report(&driver, &mesh, &estimator, &config)?;

    Ok(())
}

fn report(
    driver: &TagDriver,
    mesh: &SimulatedMesh,
    estimator: &QueueingEstimator,
    config: &Config,
) -> Result<(), Box<dyn std::error::Error>> {
    let measurements = estimator.measurements.borrow();
    info!(
        "ranging ok: {}, state bitmap: {:#010b}",
        driver.is_ranging_ok(),
        driver.ranging_state()
    );

    let mut anchor_list = [0u8; 16];
    let count = driver.active_anchor_id_list(&mut anchor_list, mesh.now_ms());
    info!("active anchors: {:?}", &anchor_list[..count]);

    if measurements.is_empty() {
        warn!("no measurements emitted");
        return Ok(());
    }

    let mut worst = 0.0f64;
    let mut sum_squared = 0.0f64;
    for m in measurements.iter() {
        let expected = mesh.true_distance_diff(m.anchor_ids[0], m.anchor_ids[1]);
        let residual = (m.distance_diff - expected).abs();
        worst = worst.max(residual);
        sum_squared += residual * residual;
    }
    let rms = (sum_squared / measurements.len() as f64).sqrt();

    info!(
        "{} measurements, residual rms {:.4} m, worst {:.4} m",
        measurements.len(),
        rms,
        worst
    );
    if config.fixed_height.is_some() {
        info!("{} height measurements", estimator.height_count.borrow());
    }

    let corrections = driver.clock_correction_log();
    for anchor in 0..NR_OF_TDOA2_ANCHORS {
        if corrections[anchor] > 0.0 {
            info!(
                "anchor {}: clock correction {:.9}",
                anchor, corrections[anchor]
            );
        }
    }

    if let Some(path) = &config.dump_measurements {
        let mut file = std::fs::File::create(path)?;
        for m in measurements.iter() {
            let record = MeasurementRecord {
                anchor_ids: m.anchor_ids,
                distance_diff: m.distance_diff,
                expected: mesh.true_distance_diff(m.anchor_ids[0], m.anchor_ids[1]),
                std_dev: m.std_dev,
            };
            writeln!(file, "{}", serde_json::to_string(&record)?)?;
        }
        info!("measurements written to {}", path);
    }

    Ok(())
}

fn parse_tag_position(value: &str) -> Result<Point3<f32>, Box<dyn std::error::Error>> {
    let parts: Vec<&str> = value.split(',').collect();
    if parts.len() != 3 {
        return Err(format!("invalid tag position '{}', expected x,y,z", value).into());
    }
    Ok(Point3::new(
        parts[0].trim().parse()?,
        parts[1].trim().parse()?,
        parts[2].trim().parse()?,
    ))
}

/// Initialize logging subsystem
fn init_logging(verbose: bool) {
    let subscriber = tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true);

    if verbose {
        subscriber.with_max_level(tracing::Level::DEBUG).init();
    } else {
        subscriber.with_max_level(tracing::Level::INFO).init();
    }
}
