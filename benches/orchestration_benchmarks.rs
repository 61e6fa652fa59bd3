use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use clusterops_core::models::{HostRoleCommand, Role, RoleCommand, RoleCommandPair, Stage};
use clusterops_core::orchestration::{calculate_stage_status, progress_percent};
use clusterops_core::ordering::{RoleCommandOrderResolver, RoleGraph, RoleOrderingRules};
use clusterops_core::state_machine::HostRoleStatus;

/// Chain of `depth` roles, each starting after the previous one.
fn chained_rules(depth: usize) -> RoleOrderingRules {
    let mut rules = RoleOrderingRules::default();
    for level in 1..depth {
        rules.add(
            RoleCommandPair::new(Role::new(format!("ROLE_{}", level - 1)), RoleCommand::Start),
            RoleCommandPair::new(Role::new(format!("ROLE_{level}")), RoleCommand::Start),
        );
    }
    rules
}

fn start_stage(depth: usize, hosts: usize) -> Stage {
    let mut stage = Stage::new("bench", "Start services");
    for level in 0..depth {
        for host in 0..hosts {
            stage.add_task(HostRoleCommand::new(
                Some(format!("c64{host:02}")),
                Role::new(format!("ROLE_{level}")),
                RoleCommand::Start,
            ));
        }
    }
    stage
}

fn benchmark_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolve_role_order");
    for depth in [8usize, 32, 64] {
        let rules = chained_rules(depth);
        group.bench_with_input(BenchmarkId::from_parameter(depth), &rules, |b, rules| {
            b.iter(|| RoleCommandOrderResolver::resolve(black_box(rules.pairs()), rules))
        });
    }
    group.finish();
}

fn benchmark_partition(c: &mut Criterion) {
    let rules = chained_rules(16);
    let stage = start_stage(16, 50);
    c.bench_function("partition_stage_16x50", |b| {
        b.iter(|| RoleGraph::partition_stage(black_box(stage.clone()), &rules))
    });
}

fn benchmark_stage_status(c: &mut Criterion) {
    let mut stage = start_stage(4, 250);
    for (index, task) in stage.tasks.iter_mut().enumerate() {
        task.status = match index % 4 {
            0 => HostRoleStatus::Completed,
            1 => HostRoleStatus::InProgress,
            2 => HostRoleStatus::Queued,
            _ => HostRoleStatus::Pending,
        };
    }
    c.bench_function("calculate_stage_status_1000", |b| {
        b.iter(|| calculate_stage_status(black_box(&stage)))
    });
    c.bench_function("progress_percent_1000", |b| {
        b.iter(|| progress_percent(black_box(&stage.tasks)))
    });
}

criterion_group!(
    benches,
    benchmark_resolve,
    benchmark_partition,
    benchmark_stage_status
);
criterion_main!(benches);
