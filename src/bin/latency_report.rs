use std::hint::black_box;
use std::time::{Duration, Instant};

use flash_feed::gate::IntentKind;
use flash_feed::{
    FastGate, InstrumentRegistry, KillSwitch, LobConfig, LobEngine, Normalizer, NormalizerConfig, OrderIntent,
    OrderSide, RawPayload, RiskLimits,
};
use hdrhistogram::Histogram;
use rust_decimal::Decimal;

const ITERATIONS: u64 = 1_000_000;

fn payload(i: u64) -> RawPayload {
    let base = Decimal::new(10125, 2) + Decimal::new((i % 20) as i64 * 5, 2);
    let step = Decimal::new(5, 2);
    RawPayload {
        kind: Some("bidask".into()),
        symbol: Some("TXF".into()),
        seq: Some(i + 1),
        bid_price: Some(vec![base, base - step, base - step - step]),
        bid_volume: Some(vec![Decimal::from(10 + i % 7), Decimal::from(5), Decimal::from(3)]),
        ask_price: Some(vec![base + step, base + step + step]),
        ask_volume: Some(vec![Decimal::from(4 + i % 3), Decimal::from(8)]),
        ..Default::default()
    }
}

fn report(name: &str, histogram: &Histogram<u64>, total: Duration) {
    println!("\n=== {name} (ns) ===");
    println!("Total Ops:  {}", histogram.len());
    println!("Throughput: {:.2} ops/sec", histogram.len() as f64 / total.as_secs_f64());
    println!("---------------------------");
    println!("Min:    {:6} ns", histogram.min());
    println!("P50:    {:6} ns", histogram.value_at_quantile(0.50));
    println!("P90:    {:6} ns", histogram.value_at_quantile(0.90));
    println!("P99:    {:6} ns", histogram.value_at_quantile(0.99));
    println!("P99.9:  {:6} ns", histogram.value_at_quantile(0.999));
    println!("P99.99: {:6} ns", histogram.value_at_quantile(0.9999));
    println!("Max:    {:6} ns", histogram.max());
    println!("---------------------------");

    println!("Distribution:");
    for v in histogram.iter_log(100, 2.0) {
        let count = v.count_since_last_iteration();
        if count > 0 {
            println!("<= {:6} ns: {:10} count", v.value_iterated_to(), count);
        }
    }
}

fn main() -> anyhow::Result<()> {
    println!("Preparing latency report...");

    let mut registry = InstrumentRegistry::new();
    let txf = registry.register("TXF", Decimal::new(5, 2), Decimal::ONE)?;
    let mut normalizer = Normalizer::new(registry, NormalizerConfig::default());
    let mut engine = LobEngine::with_instruments(LobConfig::default(), [txf]);
    engine.warm_up([txf]);

    // Payloads are built up front so only normalize + apply is timed
    let payloads: Vec<RawPayload> = (0..ITERATIONS).map(payload).collect();

    println!("Running {ITERATIONS} ingest iterations...");
    let mut histogram = Histogram::<u64>::new_with_bounds(1, 100_000, 3)?;
    let mut total = Duration::ZERO;
    for p in &payloads {
        let start = Instant::now();
        if let Ok(Some(event)) = normalizer.normalize(p, 0) {
            black_box(engine.apply(&event));
        }
        let elapsed = start.elapsed();
        // Outliers above the histogram bound are dropped, not fatal
        histogram.record(elapsed.as_nanos() as u64).unwrap_or(());
        total += elapsed;
    }
    report("Ingest: normalize + apply", &histogram, total);

    let limits = RiskLimits {
        // One check per microsecond stays under 1000 per millisecond
        rate_max_orders: 1_000,
        rate_window_ns: 1_000_000,
        global_rate_max_orders: 1_000,
        global_rate_window_ns: 1_000_000,
        ..RiskLimits::default()
    };
    let mut gate = FastGate::new(KillSwitch::in_memory(false)?, limits);
    gate.register_instrument(txf, Vec::new());

    println!("\nRunning {ITERATIONS} gate checks...");
    let mut histogram = Histogram::<u64>::new_with_bounds(1, 100_000, 3)?;
    let mut total = Duration::ZERO;
    for i in 0..ITERATIONS {
        let intent = OrderIntent {
            instrument: txf,
            side: if i % 2 == 0 { OrderSide::Buy } else { OrderSide::Sell },
            kind: IntentKind::New,
            price: 2025 + (i % 10) as i64,
            qty: 1,
            strategy_id: 1,
            client_order_id: i,
        };
        let start = Instant::now();
        black_box(gate.check(&intent, i as i64 * 1_000));
        let elapsed = start.elapsed();
        histogram.record(elapsed.as_nanos() as u64).unwrap_or(());
        total += elapsed;
    }
    report("Fast gate: check", &histogram, total);
    Ok(())
}
