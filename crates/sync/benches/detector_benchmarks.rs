use chrono::{Duration, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use outreach_core::DataSourceId;
use outreach_sync::{
    ActiveSync, RecoveryAction, RecoveryAttempt, StuckDetector, SyncState, SyncStatus,
};

fn active_syncs(count: usize) -> Vec<ActiveSync> {
    let now = Utc::now();
    (0..count)
        .map(|i| {
            let minutes = (i % 40) as i64;
            let mut state = SyncState::new(DataSourceId::new(), "smartlead", now - Duration::minutes(minutes));
            state.status = if i % 3 == 0 { SyncStatus::Partial } else { SyncStatus::Syncing };
            state.config.heartbeat = Some(now - Duration::minutes(minutes + 1));
            let attempts = (0..(i % 10))
                .map(|j| {
                    RecoveryAttempt::new(
                        RecoveryAction::Resume,
                        true,
                        "resumed",
                        now - Duration::minutes(j as i64 * 9),
                    )
                })
                .collect();
            ActiveSync { state, attempts }
        })
        .collect()
}

fn bench_scan(c: &mut Criterion) {
    let detector = StuckDetector::default();
    let mut group = c.benchmark_group("stuck_detector_scan");

    for count in [10usize, 100, 1_000] {
        let jobs = active_syncs(count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &jobs, |b, jobs| {
            b.iter(|| {
                let now = Utc::now();
                black_box(detector.scan(black_box(jobs), now))
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_scan);
criterion_main!(benches);
