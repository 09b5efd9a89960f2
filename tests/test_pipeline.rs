use strand::http::pipeline::{PipelineError, PipelineQueue, RequestInfo, SlotStatus};

fn permutations(items: &[u64]) -> Vec<Vec<u64>> {
    if items.len() <= 1 {
        return vec![items.to_vec()];
    }
    let mut out = Vec::new();
    for i in 0..items.len() {
        let mut rest = items.to_vec();
        let head = rest.remove(i);
        for mut tail in permutations(&rest) {
            tail.insert(0, head);
            out.push(tail);
        }
    }
    out
}

#[test]
fn test_drains_in_admission_order_for_every_completion_order() {
    let orders = permutations(&[0, 1, 2, 3]);
    assert_eq!(orders.len(), 24);

    for order in orders {
        let mut queue = PipelineQueue::new(4);
        for _ in 0..4 {
            queue.push(true, RequestInfo::default()).unwrap();
        }

        let mut drained = Vec::new();
        for seq in &order {
            queue.complete(*seq, format!("response {seq}")).unwrap();
            while let Some(slot) = queue.next_drainable() {
                assert!(slot.complete);
                assert_eq!(slot.parts, vec![format!("response {}", slot.seq)]);
                drained.push(slot.seq);
            }
        }

        assert_eq!(drained, vec![0, 1, 2, 3], "completion order {order:?}");
        assert!(queue.is_empty());
    }
}

#[test]
fn test_head_of_line_blocks_drain() {
    let mut queue = PipelineQueue::new(3);
    let first = queue.push(true, RequestInfo::default()).unwrap();
    let second = queue.push(true, RequestInfo::default()).unwrap();

    queue.complete(second, "b").unwrap();
    assert!(queue.next_drainable().is_none());
    assert_eq!(queue.front_awaiting().map(|s| s.seq), Some(first));
    assert_eq!(queue.get(second).map(|s| s.status), Some(SlotStatus::HandlerComplete));

    queue.complete(first, "a").unwrap();
    assert_eq!(queue.next_drainable().map(|d| d.parts), Some(vec!["a"]));
    assert_eq!(queue.next_drainable().map(|d| d.parts), Some(vec!["b"]));
    assert!(queue.front_awaiting().is_none());
}

#[test]
fn test_depth_bound_refuses_and_resumes() {
    let mut queue = PipelineQueue::new(2);
    let a = queue.push(true, RequestInfo::default()).unwrap();
    queue.push(true, RequestInfo::default()).unwrap();

    assert!(queue.is_full());
    assert_eq!(queue.push(true, RequestInfo::default()), None);
    assert_eq!(queue.len(), 2);

    queue.complete(a, ()).unwrap();
    queue.next_drainable().unwrap();
    assert!(!queue.is_full());
    assert_eq!(queue.push(true, RequestInfo::default()), Some(2));
}

#[test]
fn test_zero_depth_means_one() {
    let mut queue: PipelineQueue<()> = PipelineQueue::new(0);
    assert_eq!(queue.max_depth(), 1);
    assert!(queue.push(false, RequestInfo::default()).is_some());
    assert!(queue.push(false, RequestInfo::default()).is_none());
}

#[test]
fn test_complete_errors() {
    let mut queue = PipelineQueue::new(2);
    let seq = queue.push(false, RequestInfo::default()).unwrap();

    queue.complete(seq, 1).unwrap();
    assert_eq!(queue.complete(seq, 2), Err(PipelineError::AlreadyComplete(seq)));
    assert_eq!(queue.complete(7, 3), Err(PipelineError::UnknownSlot(7)));

    let drained = queue.next_drainable().unwrap();
    assert!(!drained.keep_alive);
    assert_eq!(drained.parts, vec![1]);
    // a drained slot is gone
    assert_eq!(queue.complete(seq, 4), Err(PipelineError::UnknownSlot(seq)));
}

#[test]
fn test_streamed_slot_drains_parts_as_they_arrive() {
    let mut queue = PipelineQueue::new(2);
    let first = queue.push(true, RequestInfo::default()).unwrap();
    let second = queue.push(true, RequestInfo::default()).unwrap();

    // the later request finishes while the first is still streaming
    queue.complete(second, "second").unwrap();
    queue.append(first, "head", false).unwrap();
    queue.append(first, "part 1", false).unwrap();
    assert_eq!(queue.get(first).map(|s| s.status), Some(SlotStatus::Responding));
    assert!(queue.front_awaiting().is_none());
    assert_eq!(queue.front_pending().map(|s| s.seq), Some(first));

    let drained = queue.next_drainable().unwrap();
    assert_eq!(drained.seq, first);
    assert_eq!(drained.parts, vec!["head", "part 1"]);
    assert!(!drained.complete);

    // nothing new for the front slot: the completed second slot must wait
    assert!(queue.next_drainable().is_none());

    queue.append(first, "part 2", false).unwrap();
    queue.append(first, "end", true).unwrap();
    assert!(queue.get(first).unwrap().response_complete());
    let drained = queue.next_drainable().unwrap();
    assert_eq!(drained.parts, vec!["part 2", "end"]);
    assert!(drained.complete);

    let drained = queue.next_drainable().unwrap();
    assert_eq!((drained.seq, drained.parts, drained.complete), (second, vec!["second"], true));
    assert!(queue.is_empty());
}

#[test]
fn test_append_after_final_part_is_refused() {
    let mut queue = PipelineQueue::new(1);
    let seq = queue.push(true, RequestInfo::default()).unwrap();

    queue.append(seq, 1, false).unwrap();
    queue.append(seq, 2, true).unwrap();
    assert_eq!(queue.append(seq, 3, false), Err(PipelineError::AlreadyComplete(seq)));
    assert_eq!(queue.get(seq).map(|s| s.ready_parts()), Some(2));
}
