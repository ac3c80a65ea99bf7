use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use bytes::Bytes;
use tensorfan_core::{DType, IOName, Shape, Tensor};
use tensorfan_dag::{
    demultiplex, CollapseDetails, GatherNodeInputHandler, InputHandler, SessionMetadata,
    SharedGatherHandler,
};
use tracing_subscriber::EnvFilter;

fn init_logs() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

#[test]
fn nested_fanout_gathers_inner_level_per_outer_branch() -> Result<()> {
    init_logs();

    // root -> demultiplex "A" into 2 -> inside each, demultiplex "B" into 3.
    let root = SessionMetadata::new();
    let a_branches = root.generate_subsessions("A", 2)?;
    let gather_names: HashSet<String> = ["B".to_string()].into();

    let mut reduced_keys = Vec::new();
    for (a_idx, a_meta) in a_branches.iter().enumerate() {
        let leaves = a_meta.generate_subsessions("B", 3)?;

        // The gather node for this branch is built from any leaf's collapse.
        let (reduced, details) = leaves[0].collapse(&gather_names)?;
        ensure!(details.collapsed_sizes == vec![3]);
        let mut handler = GatherNodeInputHandler::new(1, details);

        // Each leaf emits one (1, 4) f32 tensor.
        for (b_idx, leaf) in leaves.iter().enumerate() {
            let value = (a_idx * 10 + b_idx) as f32;
            let shard_id = leaf.shard_id(&gather_names)?;
            ensure!(shard_id as usize == b_idx, "dense ids over one level");
            handler.set_input(
                IOName::from("scores"),
                f32_tensor(&[1, 4], &[value; 4]),
                shard_id,
            )?;
            handler.notify_finished_dependency()?;
        }

        ensure!(handler.is_ready());
        let gathered = handler
            .take_inputs()
            .remove(&IOName::from("scores"))
            .context("gathered input missing")?;
        ensure!(gathered.desc.shape.dims() == &[1, 3, 4]);
        let floats = tensor_f32s(&gathered);
        for (b_idx, chunk) in floats.chunks_exact(4).enumerate() {
            ensure!(chunk == &[(a_idx * 10 + b_idx) as f32; 4]);
        }
        reduced_keys.push(reduced.session_key().to_string());
    }

    // The two outer branches keep distinct identities after the inner gather.
    assert_eq!(reduced_keys, vec!["A_0".to_string(), "A_1".to_string()]);
    Ok(())
}

#[test]
fn demultiplex_then_gather_reproduces_source_bytes() -> Result<()> {
    init_logs();

    let data: Vec<f32> = (0..20).map(|i| i as f32 * 0.5).collect();
    let source = f32_tensor(&[5, 1, 4], &data);

    let metas = SessionMetadata::new().generate_subsessions("split", 5)?;
    let shards = demultiplex(&source, Some(5))?;
    ensure!(shards.len() == metas.len());

    let names: HashSet<String> = ["split".to_string()].into();
    let (_, details) = metas[0].collapse(&names)?;
    let mut handler = GatherNodeInputHandler::new(1, details);
    // Feed shards back out of order; shard ids carry the placement.
    for (meta, shard) in metas.iter().zip(shards).rev() {
        handler.set_input(IOName::from("x"), shard, meta.shard_id(&names)?)?;
        handler.notify_finished_dependency()?;
    }

    ensure!(handler.is_ready());
    let gathered = &handler.inputs()[&IOName::from("x")];
    ensure!(gathered.desc.shape.dims() == &[1, 5, 4]);
    ensure!(gathered.host_bytes() == source.host_bytes());
    Ok(())
}

#[test]
fn shared_handler_consolidates_exactly_once_across_threads() -> Result<()> {
    init_logs();

    let shard_count = 8u32;
    let details = CollapseDetails {
        collapsed_names: vec!["fan".to_string()],
        collapsed_sizes: vec![shard_count],
    };
    let handler = Arc::new(SharedGatherHandler::new(1, details));

    let mut completions = Vec::new();
    std::thread::scope(|scope| {
        let mut joins = Vec::new();
        for shard_id in 0..shard_count {
            let handler = Arc::clone(&handler);
            joins.push(scope.spawn(move || -> Result<bool> {
                handler.set_input(
                    IOName::from("x"),
                    f32_tensor(&[1, 2], &[shard_id as f32; 2]),
                    shard_id,
                )?;
                Ok(handler.notify_finished_dependency()?)
            }));
        }
        for join in joins {
            completions.push(join.join().expect("worker panicked"));
        }
    });

    let completed: Vec<bool> = completions
        .into_iter()
        .collect::<Result<_>>()
        .context("shard branch failed")?;
    ensure!(
        completed.iter().filter(|done| **done).count() == 1,
        "exactly one branch must observe completion"
    );

    let gathered = handler
        .take_inputs()
        .remove(&IOName::from("x"))
        .context("gathered input missing")?;
    ensure!(gathered.desc.shape.dims() == &[1, 8, 2]);
    let floats = tensor_f32s(&gathered);
    for (shard_id, chunk) in floats.chunks_exact(2).enumerate() {
        ensure!(chunk == &[shard_id as f32; 2]);
    }
    Ok(())
}

fn f32_tensor(dims: &[usize], data: &[f32]) -> Tensor {
    let mut bytes = Vec::with_capacity(data.len() * 4);
    for v in data {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    Tensor::from_cpu_bytes(DType::F32, Shape::from_slice(dims), Bytes::from(bytes))
}

fn tensor_f32s(tensor: &Tensor) -> Vec<f32> {
    tensor
        .host_bytes()
        .expect("host tensor")
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}
