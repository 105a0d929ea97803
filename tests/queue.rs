// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use qhp_bridge::message::{Context, Kind, Message};
use qhp_bridge::queue::DurableQueue;
use serde_json::json;

fn msg(id: &str) -> Message {
    Message::new(id, Kind::Request, json!({}), Context::system("test"))
}

/// S8. Graceful shutdown mid-drain: drain stops part-way through, the
/// remaining entries are recoverable on the next load, in original order.
#[tokio::test]
async fn remaining_entries_survive_a_drain_interrupted_partway() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("peer-i.json");

    let queue = DurableQueue::load(path.clone(), Duration::from_secs(3600)).await.unwrap();
    for i in 0..10 {
        queue.enqueue(msg(&format!("m{i}"))).await.unwrap();
    }

    let sent = Arc::new(AtomicUsize::new(0));
    let sent_clone = sent.clone();
    let stop_after = 4;

    let is_ready = {
        let sent = sent.clone();
        move || sent.load(Ordering::SeqCst) < stop_after
    };

    queue
        .drain(is_ready, move |_m| {
            let sent_clone = sent_clone.clone();
            async move {
                sent_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();

    assert_eq!(sent.load(Ordering::SeqCst), 4);

    drop(queue);
    let reloaded = DurableQueue::load(path, Duration::from_secs(3600)).await.unwrap();
    assert_eq!(reloaded.len().await, 6);
}

/// Round-trip law (spec §8): `enqueue(m)` immediately followed by
/// `drain(f)` where `f` always succeeds results in exactly one call `f(m)`.
#[tokio::test]
async fn enqueue_then_drain_calls_f_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let queue = DurableQueue::load(dir.path().join("peer-i.json"), Duration::from_secs(3600))
        .await
        .unwrap();

    queue.enqueue(msg("only")).await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = calls.clone();
    queue
        .drain(
            || true,
            move |_m| {
                let calls_clone = calls_clone.clone();
                async move {
                    calls_clone.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        )
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
