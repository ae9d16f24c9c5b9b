use streamnet_core::entity::Network;
use streamnet_core::record::RecordKind;
use streamnet_core::{DataRecord, Record, RuntimeConfig, Stream};

fn data(value: i32) -> Record {
    let mut rec = DataRecord::default();
    rec.set_tag(0, value);
    Record::from(rec)
}

fn drain(stream: &Stream<Record>) -> Vec<Record> {
    let reader = stream.open_reader();
    let mut out = Vec::new();
    loop {
        let rec = reader.read();
        let done = rec.is_terminate();
        out.push(rec);
        if done {
            return out;
        }
    }
}

#[test]
fn test_barrier_across_three_inputs() {
    let net = Network::local(RuntimeConfig::default());
    let inputs: Vec<Stream<Record>> = (0..3).map(|_| net.stream(0)).collect();
    let output = net.collector_static(&inputs).unwrap();

    let writers: Vec<_> = inputs.iter().map(Stream::open_writer).collect();
    let producers: Vec<_> = writers
        .into_iter()
        .enumerate()
        .map(|(i, writer)| {
            std::thread::spawn(move || {
                let i = i32::try_from(i).unwrap();
                writer.write(data(i));
                writer.write(data(i + 100));
                writer.write(Record::sort_end(0, 3));
                writer.write(Record::terminate());
            })
        })
        .collect();

    let out = drain(&output);
    for producer in producers {
        producer.join().unwrap();
    }
    net.wait();

    let count = |kind| out.iter().filter(|r| r.kind() == kind).count();
    assert_eq!(count(RecordKind::Data), 6);
    assert_eq!(count(RecordKind::Terminate), 1);
    assert_eq!(count(RecordKind::SortEnd), 0);
    assert_eq!(net.metrics().snapshot().barriers_released, 1);
}

#[test]
fn test_dynamic_collector_growth() {
    let net = Network::local(RuntimeConfig::default());
    let input = net.stream(0);
    let output = net.collector_dynamic(&input).unwrap();
    let writer = input.open_writer();

    let mut branch_writers = Vec::new();
    for _ in 0..4 {
        let branch = net.stream(2);
        branch_writers.push(branch.open_writer());
        writer.write(Record::collect(branch));
    }
    for (i, branch) in branch_writers.into_iter().enumerate() {
        let i = i32::try_from(i).unwrap();
        branch.write(data(i));
        branch.write(data(i + 10));
        branch.write(Record::terminate());
    }
    writer.write(Record::terminate());

    let out = drain(&output);
    net.wait();
    let mut values: Vec<i32> = out
        .iter()
        .filter_map(|r| r.as_data().and_then(|d| d.tag(0)))
        .collect();
    values.sort_unstable();
    assert_eq!(values, vec![0, 1, 2, 3, 10, 11, 12, 13]);
    assert_eq!(out.iter().filter(|r| r.is_terminate()).count(), 1);
}

#[test]
fn test_nested_barrier_levels() {
    let net = Network::local(RuntimeConfig::default());
    let inputs: Vec<Stream<Record>> = (0..3).map(|_| net.stream(0)).collect();
    let output = net.collector_static(&inputs).unwrap();
    for input in &inputs {
        let writer = input.open_writer();
        writer.write(Record::sort_end(2, 8));
        writer.write(Record::terminate());
    }

    let out = drain(&output);
    net.wait();
    assert!(matches!(out[0], Record::SortEnd { level: 1, num: 8 }));
    assert!(out[1].is_terminate());
}

#[test]
fn test_collect_during_pending_barrier_releases_once() {
    let net = Network::local(RuntimeConfig::default());
    let input = net.stream(0);
    let output = net.collector_dynamic(&input).unwrap();
    let writer = input.open_writer();

    let early = net.stream(0);
    let early_writer = early.open_writer();
    writer.write(Record::collect(early));
    early_writer.write(data(1));
    early_writer.write(Record::sort_end(1, 7));
    early_writer.write(data(2));
    early_writer.write(Record::terminate());

    // Joins while the early branch may already be parked on the barrier.
    let late = net.stream(0);
    let late_writer = late.open_writer();
    writer.write(Record::collect(late));
    late_writer.write(data(3));
    late_writer.write(Record::sort_end(1, 7));
    late_writer.write(Record::terminate());

    // The initial input ends without reaching the barrier.
    writer.write(Record::terminate());

    let out = drain(&output);
    net.wait();

    let barriers: Vec<usize> = out
        .iter()
        .enumerate()
        .filter(|(_, r)| r.kind() == RecordKind::SortEnd)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(barriers.len(), 1);
    assert!(matches!(out[barriers[0]], Record::SortEnd { level: 0, num: 7 }));

    let position = |value| {
        out.iter()
            .position(|r| r.as_data().and_then(|d| d.tag(0)) == Some(value))
            .unwrap()
    };
    assert!(position(1) < barriers[0]);
    assert!(position(3) < barriers[0]);
    assert!(position(2) > barriers[0]);
    assert_eq!(out.iter().filter(|r| r.is_terminate()).count(), 1);
    assert_eq!(net.metrics().snapshot().barrier_mismatches, 0);
}
