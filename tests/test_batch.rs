use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chelper::batch::{parse_moves, BatchError, BatchRunner};
use chelper::configfile::{ConfigFile, McuConfig, StepperConfig};
use chelper::msgblock::{parse_int, BlockCheck, BlockParser, MESSAGE_HEADER_SIZE, MESSAGE_TRAILER_SIZE};
use chelper::serialqueue::{SerialQueue, SerialQueueError, TransportKind};
use chelper::steppersync::SteppersSyncError;

const CONFIG: &str = "
[mcu]
serial: /dev/null
clock_freq: 16000000

[stepper_x]
oid: 0
step_distance: 0.01

[stepper_y]
oid: 1
step_distance: 0.0125
high_precision: True
invert_dir: True
";

// 15mm along x, then 10mm back along -y, then 5mm back along -x
const MOVES: &str = "
1.0  0.1 0.2 0.1   0 0 0    1 0 0   0 50 500
1.5  0.1 0.1 0.1   15 0 0   0 -1 0  0 50 500
2.0  0.1 0.1 0.1   15 -10 0 -1 0 0  0 25 250
";

// Net step count per oid, decoded from a stream of message blocks
fn net_steps(data: &[u8], hp_oids: &[u32]) -> HashMap<u32, i64> {
    let mut parser = BlockParser::new();
    let mut dirs: HashMap<u32, bool> = HashMap::new();
    let mut net: HashMap<u32, i64> = HashMap::new();
    let mut pos = 0;
    while pos < data.len() {
        let BlockCheck::Valid(len) = parser.check(&data[pos..]) else {
            panic!("invalid block at offset {}", pos);
        };
        let payload = &data[pos + MESSAGE_HEADER_SIZE..pos + len - MESSAGE_TRAILER_SIZE];
        let mut p = 0;
        while p < payload.len() {
            let tag = parse_int(payload, &mut p).unwrap();
            let oid = parse_int(payload, &mut p).unwrap();
            match tag {
                20 => {
                    let nfields = if hp_oids.contains(&oid) { 5 } else { 3 };
                    let args: Vec<u32> = (0..nfields).map(|_| parse_int(payload, &mut p).unwrap()).collect();
                    let count = args[1] as i64;
                    let sign = if dirs.get(&oid).copied().unwrap_or(false) { 1 } else { -1 };
                    *net.entry(oid).or_default() += sign * count;
                }
                21 => {
                    let dir = parse_int(payload, &mut p).unwrap();
                    dirs.insert(oid, dir != 0);
                }
                _ => panic!("unexpected command tag {}", tag),
            }
        }
        pos += len;
    }
    net
}

#[test]
fn test_batch_run_to_debug_file() {
    let cf = ConfigFile::parse(CONFIG).unwrap();
    let mut mcu = McuConfig::from_config(&cf).unwrap();
    mcu.transport = TransportKind::DebugFile;
    let steppers = StepperConfig::all_from_config(&cf).unwrap();
    assert_eq!(steppers.len(), 2);

    let out = tempfile::NamedTempFile::new().unwrap();
    let fd = OwnedFd::from(out.reopen().unwrap());
    let sq = Arc::new(SerialQueue::new(fd, TransportKind::DebugFile).unwrap());
    let mut runner = BatchRunner::new(&mcu, &steppers, sq.clone()).unwrap();
    for mv in parse_moves(MOVES).unwrap().iter() {
        runner.queue_move(mv).unwrap();
    }
    let summary = runner.finish(Duration::from_secs(10)).unwrap();
    sq.exit();

    let positions: HashMap<char, i64> = summary.positions.iter().copied().collect();
    assert!((positions[&'x'] - 1000).abs() <= 1, "x at {}", positions[&'x']);
    assert!((positions[&'y'] + 800).abs() <= 1, "y at {}", positions[&'y']);
    assert!(summary.stats.contains("ready_bytes=0 upcoming_bytes=0"));

    let data = std::fs::read(out.path()).unwrap();
    let net = net_steps(&data, &[1]);
    assert_eq!(net[&0], positions[&'x']);
    // Direction bits of stepper_y are inverted on the wire
    assert_eq!(-net[&1], positions[&'y']);
}

#[test]
fn test_batch_without_moves() {
    let cf = ConfigFile::parse(CONFIG).unwrap();
    let mut mcu = McuConfig::from_config(&cf).unwrap();
    mcu.transport = TransportKind::DebugFile;
    let steppers = StepperConfig::all_from_config(&cf).unwrap();
    let file = tempfile::tempfile().unwrap();
    let sq = Arc::new(SerialQueue::new(OwnedFd::from(file), TransportKind::DebugFile).unwrap());
    let runner = BatchRunner::new(&mcu, &steppers, sq.clone()).unwrap();
    let summary = runner.finish(Duration::from_secs(1)).unwrap();
    assert_eq!(summary.positions, vec![('x', 0), ('y', 0)]);
    assert_eq!(sq.stats().bytes_write, 0);
    sq.exit();
}

#[test]
fn test_batch_fails_when_link_is_lost() {
    let cf = ConfigFile::parse(CONFIG).unwrap();
    let mcu = McuConfig::from_config(&cf).unwrap();
    assert_eq!(mcu.transport, TransportKind::Uart);
    let steppers = StepperConfig::all_from_config(&cf).unwrap();

    let (host, peer) = UnixStream::pair().unwrap();
    drop(peer);
    let sq = Arc::new(SerialQueue::new(OwnedFd::from(host), TransportKind::Uart).unwrap());
    let deadline = Instant::now() + Duration::from_secs(5);
    while !sq.is_exited() {
        assert!(Instant::now() < deadline, "read of a closed link did not stop the queue");
        thread::sleep(Duration::from_millis(2));
    }

    let mut runner = BatchRunner::new(&mcu, &steppers, sq.clone()).unwrap();
    let mut result = Ok(());
    for mv in parse_moves(MOVES).unwrap().iter() {
        result = runner.queue_move(mv);
        if result.is_err() {
            break;
        }
    }
    let err = match result {
        Err(e) => e,
        Ok(()) => runner.finish(Duration::from_secs(1)).unwrap_err(),
    };
    assert!(
        matches!(
            err,
            BatchError::Sync(SteppersSyncError::Transport(SerialQueueError::Disconnected)) | BatchError::Disconnected(_)
        ),
        "unexpected error {:?}",
        err
    );
}
