use std::time::{Duration, Instant};

use more_asserts::assert_ge;
use pretty_assertions::assert_eq;

use spindle::cancel::CancelToken;
use spindle::channel::error::{RecvError, RecvTimeoutError, SendTimeoutError, TrySendError};
use spindle::channel::{self, Kind, Wait};
use spindle::runtime::{Builder, Runtime};
use spindle::select::{self, Selectable};
use spindle::time;
use spindle::zref::{Zref, ZrefChannel, HANDOFF};

#[test]
fn pipeline_across_coroutines() {
    let runtime = Runtime::new();
    let (raw_sender, raw_receiver) = channel::bounded(2);
    let (cooked_sender, cooked_receiver) = channel::bounded(2);
    let transformer = runtime.spawn(move || {
        for value in raw_receiver {
            cooked_sender.send(value * 2).unwrap();
        }
    });
    let producer = runtime.spawn(move || {
        for i in 1..=50i64 {
            raw_sender.send(i).unwrap();
        }
    });
    let consumer = runtime.spawn(move || cooked_receiver.into_iter().sum::<i64>());
    producer.join().unwrap();
    transformer.join().unwrap();
    assert_eq!(consumer.join().unwrap(), 2550);
}

#[test]
fn blocked_send_unblocks_on_recv() {
    let runtime = Runtime::new();
    let (sender, receiver) = channel::bounded(2);
    sender.try_send(1).unwrap();
    sender.try_send(2).unwrap();
    assert_eq!(sender.try_send(3), Err(TrySendError::Full(3)));
    let blocked = runtime.spawn(move || {
        sender.send(3).unwrap();
        sender.stats().sends
    });
    time::sleep(Duration::from_millis(50));
    assert_eq!(receiver.recv(), Ok(1));
    assert_eq!(blocked.join().unwrap(), 3);
    assert_eq!(receiver.recv(), Ok(2));
    assert_eq!(receiver.recv(), Ok(3));
}

#[test]
fn select_between_coroutines() {
    let runtime = Runtime::new();
    let (command_sender, command_receiver) = channel::bounded::<i32>(1);
    let (event_sender, event_receiver) = channel::bounded::<i32>(1);
    let selector = runtime.spawn(move || {
        let clauses: [&dyn Selectable; 2] = [&command_receiver, &event_receiver];
        let (index, permit) = select::select(&clauses);
        match index {
            0 => command_receiver.complete_recv(permit).unwrap(),
            _ => event_receiver.complete_recv(permit).unwrap(),
        }
    });
    let producer = runtime.spawn(move || {
        time::sleep(Duration::from_millis(20));
        event_sender.send(17).unwrap();
        // Keep the unselected channel open until the select finished.
        time::sleep(Duration::from_millis(50));
        drop(command_sender);
    });
    assert_eq!(selector.join().unwrap(), 17);
    producer.join().unwrap();
}

#[test]
fn select_timeout_then_delivery() {
    let runtime = Runtime::new();
    let (sender, receiver) = channel::bounded::<i32>(1);
    let outcome = runtime.spawn(move || {
        let clauses: [&dyn Selectable; 1] = [&receiver];
        let timed_out = select::select_timeout(&clauses, Duration::from_millis(20)).is_err();
        let (_, permit) = select::select(&clauses);
        (timed_out, receiver.complete_recv(permit).unwrap())
    });
    let producer = runtime.spawn(move || {
        time::sleep(Duration::from_millis(60));
        sender.send(5).unwrap();
    });
    assert_eq!(outcome.join().unwrap(), (true, 5));
    producer.join().unwrap();
}

#[test]
fn cancellation_reaches_blocked_coroutines() {
    let runtime = Runtime::new();
    let root = CancelToken::new();
    let (_sender, receiver) = channel::bounded::<i32>(1);
    let blocked: Vec<_> = (0..3)
        .map(|_| {
            let token = root.child();
            let receiver = receiver.clone();
            runtime.spawn(move || receiver.recv_cancelable(&token))
        })
        .collect();
    time::sleep(Duration::from_millis(20));
    root.trigger();
    for handle in blocked {
        assert_eq!(handle.join().unwrap(), Err(RecvTimeoutError::Canceled));
    }
}

#[test]
fn cancellation_spares_siblings() {
    let runtime = Runtime::new();
    let root = CancelToken::new();
    let canceled = root.child();
    let spared = root.child();
    let (sender, receiver) = channel::bounded::<i32>(1);
    let doomed = {
        let receiver = receiver.clone();
        let token = canceled.clone();
        runtime.spawn(move || receiver.recv_cancelable(&token))
    };
    let survivor = runtime.spawn(move || receiver.recv_cancelable(&spared));
    time::sleep(Duration::from_millis(20));
    canceled.trigger();
    doomed.join().unwrap().unwrap_err();
    sender.send(9).unwrap();
    assert_eq!(survivor.join().unwrap(), Ok(9));
}

#[test]
fn conflated_keeps_latest() {
    let runtime = Runtime::new();
    let (sender, receiver) = channel::conflated();
    let producer = runtime.spawn(move || {
        for i in 0..100 {
            sender.try_send(i).unwrap();
        }
        sender.stats().sends
    });
    assert_eq!(producer.join().unwrap(), 100);
    assert_eq!(receiver.recv(), Ok(99));
    assert_eq!(receiver.recv(), Err(RecvError::Closed));
}

#[test]
fn rendezvous_counters_balance() {
    let runtime = Runtime::new();
    let (sender, receiver) = channel::rendezvous::<u32>();
    let stats_handle = sender.clone();
    let producer = runtime.spawn(move || {
        for i in 0..200 {
            sender.send(i).unwrap();
        }
    });
    let consumer = runtime.spawn(move || receiver.into_iter().count());
    producer.join().unwrap();
    // The retained stats handle keeps the channel open, close explicitly.
    stats_handle.close();
    assert_eq!(consumer.join().unwrap(), 200);
    let stats = stats_handle.stats();
    assert_eq!(stats.kind, Kind::Rendezvous);
    assert_eq!(stats.sends, 200);
    assert_eq!(stats.recvs, 200);
    assert_eq!(stats.bytes_sent, stats.bytes_recvd);
}

#[test]
fn send_timeout_under_load() {
    let runtime = Runtime::new();
    let (sender, receiver) = channel::bounded(1);
    sender.try_send(1).unwrap();
    let result = runtime
        .spawn(move || sender.send_timeout(2, Duration::from_millis(30)))
        .join()
        .unwrap();
    assert_eq!(result, Err(SendTimeoutError::Timeout(2)));
    assert_eq!(receiver.recv(), Ok(1));
}

#[test]
fn many_producers_share_bounded_channel() {
    let runtime = Builder::default().parallelism(2).build();
    let (sender, receiver) = channel::bounded(8);
    let producers: Vec<_> = (0..8u64)
        .map(|p| {
            let sender = sender.clone();
            runtime.spawn(move || {
                for i in 0..100u64 {
                    sender.send(p * 1000 + i).unwrap();
                }
            })
        })
        .collect();
    drop(sender);
    let consumer = runtime.spawn(move || receiver.into_iter().count());
    for producer in producers {
        producer.join().unwrap();
    }
    assert_eq!(consumer.join().unwrap(), 800);
}

#[test]
fn zref_handoff_between_coroutines() {
    let runtime = Runtime::new();
    let channel = ZrefChannel::bind(Kind::Rendezvous, 0, HANDOFF).unwrap();
    let producer = {
        let channel = channel.clone();
        runtime.spawn(move || {
            for i in 0..100u32 {
                let payload = i.to_be_bytes().to_vec().into_boxed_slice();
                channel.send(Zref::from_box(payload), Wait::Forever).unwrap();
            }
        })
    };
    let consumer = {
        let channel = channel.clone();
        runtime.spawn(move || {
            let mut descriptors = Vec::with_capacity(100);
            for i in 0..100u32 {
                let zref = channel.recv(Wait::Forever).unwrap();
                assert_eq!(unsafe { zref.as_slice() }, &i.to_be_bytes()[..]);
                descriptors.push(zref);
            }
            descriptors
        })
    };
    producer.join().unwrap();
    let descriptors = consumer.join().unwrap();
    for zref in descriptors {
        assert_eq!(zref.reclaim().unwrap().len(), 4);
    }
    let stats = channel.stats();
    assert!(stats.zerocopy);
    assert_eq!(stats.sends, 100);
    assert_eq!(stats.recvs, 100);
    assert_eq!(stats.depth, 0);
}

#[test]
fn sleep_orders_coroutines() {
    let runtime = Runtime::new();
    let start = Instant::now();
    let (sender, receiver) = channel::unbounded();
    let handles: Vec<_> = [30u64, 20, 10]
        .iter()
        .map(|&delay| {
            let sender = sender.clone();
            runtime.spawn(move || {
                time::sleep(Duration::from_millis(delay));
                sender.send(delay).unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_ge!(start.elapsed(), Duration::from_millis(30));
    let order: Vec<u64> = (0..3).map(|_| receiver.recv().unwrap()).collect();
    assert_eq!(order, vec![10, 20, 30]);
}

#[test]
fn random_sized_descriptors() {
    let channel = ZrefChannel::bind(Kind::Unlimited, 0, HANDOFF).unwrap();
    let mut expected = 0u64;
    for _ in 0..100 {
        let len = fastrand::usize(1..256);
        expected += len as u64;
        channel.send(Zref::from_box(vec![0u8; len].into_boxed_slice()), Wait::NonBlocking).unwrap();
    }
    let mut total = 0u64;
    for _ in 0..100 {
        total += channel.recv(Wait::NonBlocking).unwrap().reclaim().unwrap().len() as u64;
    }
    assert_eq!(total, expected);
}

#[test]
fn close_runs_on_scope_exit() {
    let runtime = Runtime::new();
    let (sender, receiver) = channel::bounded::<i32>(4);
    let consumer = runtime.spawn(move || receiver.into_iter().sum::<i32>());
    {
        let sender = scopeguard::guard(sender, |sender| sender.close());
        sender.send(1).unwrap();
        sender.send(2).unwrap();
    }
    assert_eq!(consumer.join().unwrap(), 3);
}

#[test]
fn throughput_between_snapshots() {
    let (sender, receiver) = channel::bounded(16);
    let earlier = sender.stats();
    for i in 0..16 {
        sender.try_send(i).unwrap();
    }
    for _ in 0..16 {
        receiver.try_recv().unwrap();
    }
    std::thread::sleep(Duration::from_millis(10));
    let later = sender.stats();
    let throughput = later.throughput_since(&earlier);
    assert!(throughput.sends_per_sec > 0.0);
    assert!(throughput.recvs_per_sec > 0.0);
}
