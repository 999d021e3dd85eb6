use approval_core::ids::{ProjectId, RuleId};
use approval_core::model::{FieldPattern, Level, SensitiveDataRule};
use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rule_matcher::{match_changes, ChangeField};

fn make_rules(n: usize) -> Vec<SensitiveDataRule> {
    let now = Utc::now();
    (0..n)
        .map(|i| SensitiveDataRule {
            id: RuleId::new(),
            project: ProjectId::from("bench"),
            title: format!("rule-{i}"),
            level: Level::High,
            enabled: true,
            table_pattern: Some(format!("table_{}", i % 16)),
            field_patterns: vec![FieldPattern { name_or_glob: "*_token".into(), regex: None }],
            creator: "bench".into(),
            updater: "bench".into(),
            create_time: now,
            update_time: now,
        })
        .collect()
}

fn bench_match(c: &mut Criterion) {
    let rules = make_rules(200);
    let changes: Vec<ChangeField> = (0..50)
        .map(|i| ChangeField::new(format!("table_{}", i % 16), "api_token"))
        .collect();

    c.bench_function("match_changes_200x50", |b| {
        b.iter(|| {
            let (matched, level) = match_changes(black_box(&changes), black_box(&rules));
            black_box((matched.len(), level));
        })
    });
}

criterion_group!(benches, bench_match);
criterion_main!(benches);
