//! # Topic Matching Benchmarks
//!
//! Routing cost of the in-memory broker is dominated by selector matching.
//!
//! | Case | Target |
//! |------|--------|
//! | Concrete selector, exact key | < 100ns |
//! | `#` prefix with backtracking | < 1µs |

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use messagebus::domain::TopicSelector;
use messagebus::topic::{listen_topic, parse_topic, publish_topic};

fn bench_selector_matching(c: &mut Criterion) {
    let mut group = c.benchmark_group("topic-selector");

    let cases = [
        ("concrete", "u1.ws-1.updates".to_string()),
        ("single_wildcards", listen_topic(None, Some("ws-1"), None)),
        ("multi_wildcard", "#.updates".to_string()),
        ("catch_all", "#".to_string()),
    ];

    for (name, pattern) in cases {
        let selector = TopicSelector::new(pattern);
        group.bench_function(BenchmarkId::new("matches", name), |b| {
            b.iter(|| black_box(selector.matches(black_box("u1.ws-1.updates"))))
        });
    }

    group.finish();
}

fn bench_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("topic-fanout");

    for listeners in [10usize, 100, 1000] {
        let selectors: Vec<TopicSelector> = (0..listeners)
            .map(|i| TopicSelector::new(listen_topic(None, Some(&format!("ws-{i}")), None)))
            .collect();
        let key = publish_topic("u1", &format!("ws-{}", listeners / 2), "updates");

        group.throughput(Throughput::Elements(listeners as u64));
        group.bench_with_input(BenchmarkId::new("route", listeners), &key, |b, key| {
            b.iter(|| selectors.iter().filter(|s| s.matches(key)).count())
        });
    }

    group.finish();
}

fn bench_parse(c: &mut Criterion) {
    c.bench_function("parse_topic", |b| {
        b.iter(|| black_box(parse_topic(black_box("owner-123.workspace-456.headless-log"))))
    });
}

criterion_group!(benches, bench_selector_matching, bench_fanout, bench_parse);
criterion_main!(benches);
