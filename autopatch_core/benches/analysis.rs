//! Hot-path benchmarks: the per-pulse analyzers.

use autopatch_core::analysis::{
    ResealConfig, ResealMonitor, SealRateConfig, SealRateController,
};
use criterion::{Criterion, black_box, criterion_group, criterion_main};

fn bench_reseal_monitor(c: &mut Criterion) {
    c.bench_function("reseal_monitor_update", |b| {
        let mut monitor = ResealMonitor::new(ResealConfig::default());
        let mut t = 0.0;
        b.iter(|| {
            t += 0.2;
            let r = 1e9 + (t * 7.0).sin() * 1e7;
            black_box(monitor.update(black_box(t), black_box(r)))
        });
    });
}

fn bench_seal_controller(c: &mut Criterion) {
    c.bench_function("seal_controller_update", |b| {
        let mut ctl = SealRateController::new(SealRateConfig::default());
        let mut t = 0.0;
        b.iter(|| {
            t += 0.2;
            let r = 50e6 + t * 0.3e6;
            black_box(ctl.update(black_box(t), black_box(r), -1000.0))
        });
    });
}

criterion_group!(benches, bench_reseal_monitor, bench_seal_controller);
criterion_main!(benches);
