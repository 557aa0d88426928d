use std::{env, num::NonZeroUsize, thread};

use collective::{Collective, LocalGroup};
use dp_optimizer::{
    DistributedNoise, DpOptimizer, DpSpec, ParamLayout, ParamMeta, Result, Sgd,
};
use log::info;
use rand::{SeedableRng, rngs::StdRng};

const STEPS: usize = 60;
const LEARNING_RATE: f32 = 0.4;
const EXAMPLES_PER_WORKER: usize = 16;

/// Trains `y = 2x + 1` across a thread-per-worker group with the full
/// private step pipeline: per-example clipping locally, one calibrated noise
/// injection at the leader, identical reduced gradients everywhere.
fn main() -> Result<()> {
    env_logger::init();

    let world_size = env::var("WORLD_SIZE")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(2);
    let world_size = NonZeroUsize::new(world_size).unwrap_or(NonZeroUsize::MIN);

    info!(world_size = world_size.get(); "starting worker threads");

    let shards = make_shards(world_size.get());

    let handles: Vec<_> = LocalGroup::group(world_size)
        .into_iter()
        .zip(shards)
        .map(|(group, shard)| thread::spawn(move || run_worker(group, shard)))
        .collect();

    for handle in handles {
        let (rank, (weight, bias), loss) = handle.join().expect("worker thread panicked")?;
        info!(rank = rank; "done: weight={weight:.3} bias={bias:.3} loss={loss:.5}");
    }

    Ok(())
}

fn run_worker(group: LocalGroup, shard: Vec<(f32, f32)>) -> Result<(usize, (f32, f32), f32)> {
    let rank = group.rank();

    let mut spec = DpSpec::new(0.3, 1.0);
    spec.expected_batch_size = NonZeroUsize::new(shard.len());
    let max_grad_norm = spec.max_grad_norm;

    let layout = ParamLayout::new(vec![
        ParamMeta::new("weight", 1, true),
        ParamMeta::new("bias", 1, true),
    ]);

    let noise = DistributedNoise::new(&spec, &group, StdRng::seed_from_u64(0xC0FFEE))?;
    let sgd = Sgd::new(LEARNING_RATE, vec![vec![0.0], vec![0.0]]);
    let mut opt = DpOptimizer::new(spec, layout, noise, sgd, group)?;

    let mut last_loss = 0.0;

    for step in 0..STEPS {
        let weights = opt.update_rule().weights();
        let (w, b) = (weights[0][0], weights[1][0]);

        let mut grad_w = 0.0;
        let mut grad_b = 0.0;

        // Clip each example's gradient before it touches the sum; the noise
        // calibration assumes exactly this bound.
        for &(x, y) in &shard {
            let err = w * x + b - y;
            let (dw, db) = clip(2.0 * err * x, 2.0 * err, max_grad_norm);
            grad_w += dw;
            grad_b += db;
        }

        opt.accumulator().accumulate(0, &[grad_w])?;
        opt.accumulator().accumulate(1, &[grad_b])?;

        let loss = mse(&shard, w, b);
        last_loss = opt.step_with(move || loss)?;

        if step % 10 == 0 {
            info!(rank = rank, step = step; "loss={last_loss:.5}");
        }
    }

    let weights = opt.update_rule().weights();
    Ok((rank, (weights[0][0], weights[1][0]), last_loss))
}

fn make_shards(world_size: usize) -> Vec<Vec<(f32, f32)>> {
    let total = world_size * EXAMPLES_PER_WORKER;
    let mut shards = vec![Vec::new(); world_size];

    for i in 0..total {
        let x = i as f32 / total as f32;
        shards[i % world_size].push((x, 2.0 * x + 1.0));
    }

    shards
}

fn clip(dw: f32, db: f32, bound: f32) -> (f32, f32) {
    let norm = (dw * dw + db * db).sqrt();

    if norm > bound {
        (dw * bound / norm, db * bound / norm)
    } else {
        (dw, db)
    }
}

fn mse(shard: &[(f32, f32)], w: f32, b: f32) -> f32 {
    let sum: f32 = shard
        .iter()
        .map(|&(x, y)| {
            let err = w * x + b - y;
            err * err
        })
        .sum();

    sum / shard.len().max(1) as f32
}
