//! Fuzz target for candidate reconciliation.
//!
//! Feeds arbitrary candidate sets to a multi-sequence request and checks
//! that buffers stay aligned and no call panics.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use specsync_core::engine::{CandidateSet, DraftPipeline, GeneratedSequence, SamplingParams};
use specsync_core::scheduler::RequestId;
use specsync_core::SyncConfig;

#[derive(Debug, Arbitrary)]
enum Op {
    Seed(Vec<(u8, Vec<u8>)>),
    Update { candidates: Vec<(u8, Vec<u8>)>, sync: bool },
    Snapshot,
}

fn candidate_set(raw: &[(u8, Vec<u8>)]) -> CandidateSet {
    raw.iter()
        .map(|(grouped_id, tokens)| {
            let tokens: Vec<u32> = tokens.iter().map(|&t| u32::from(t % 8)).collect();
            (u64::from(grouped_id % 4), GeneratedSequence::from_tokens(&tokens))
        })
        .collect()
}

fuzz_target!(|ops: Vec<Op>| {
    let mut pipeline = DraftPipeline::from_config(&SyncConfig::default());
    let params = SamplingParams::with_assistant_tokens(4).num_return_sequences(4);
    let _ = pipeline.add_request(RequestId(0), vec![1, 2, 3], params);
    pipeline.pull_awaiting_requests();

    for op in ops.iter().take(64) {
        // Precondition errors are allowed; panics are not.
        let _ = match op {
            Op::Seed(raw) => pipeline.init_request_by_candidate(RequestId(0), &candidate_set(raw)),
            Op::Update { candidates, sync } => {
                pipeline.update_request(RequestId(0), &candidate_set(candidates), *sync)
            }
            Op::Snapshot => pipeline.get_generated_requests().map(|_| Default::default()),
        };

        if let Some(request) = pipeline.directory().get(RequestId(0)) {
            for seq in request.sequences() {
                assert_eq!(seq.generated_ids().len(), seq.generated_log_probs().len());
            }
            assert!(request.num_processed_tokens() <= request.context_len());
        }
    }
});
