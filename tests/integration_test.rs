//! 統合テスト
//!
//! シミュレーションアダプタを配線したフルスタック（ディスパッチャ →
//! オーケストレータ → チップエンジン → レジスタ）でエンドツーエンドの
//! シナリオを検証する。

use std::sync::Arc;
use std::time::{Duration, Instant};

use gpib_core::adapters::sim::SimFixture;
use gpib_core::bus;
use gpib_core::chip::EosFlags;
use gpib_core::{
    BoardId, BoardStatus, BusEvent, BusLines, BusRuntime, DeviceAddr, GpibError, Reply, Request,
    Session, SessionCaps, dispatch,
};

const BOARD: BoardId = BoardId::from_raw(0);

/// オンライン化 + 制御ミューテックス取得 + システムコントローラ化まで
/// 済ませたフルスタックを組み立てる
fn setup() -> (BusRuntime, Session, SimFixture) {
    let runtime = BusRuntime::new(1);
    let board = runtime.board(BOARD).unwrap();
    let fixture = SimFixture::new(board);

    let session = Session::new(SessionCaps::empty());
    dispatch(&runtime, &session, BOARD, Request::Online { exclusive: false }).unwrap();
    dispatch(&runtime, &session, BOARD, Request::AcquireControl).unwrap();
    dispatch(
        &runtime,
        &session,
        BOARD,
        Request::RequestSystemControl { request: true },
    )
    .unwrap();
    (runtime, session, fixture)
}

/// 条件成立までポーリングする（テスト用）
fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn write_asserts_eoi_on_last_byte_only() {
    let (runtime, session, fixture) = setup();

    let reply = dispatch(
        &runtime,
        &session,
        BOARD,
        Request::Write {
            data: vec![0x41, 0x42],
            send_eoi: true,
        },
    )
    .unwrap();
    assert_eq!(reply, Reply::Transfer { bytes: 2, end: true });
    assert_eq!(fixture.sim.tx_data(), vec![(0x41, false), (0x42, true)]);
}

#[test]
fn read_stops_at_eoi_before_buffer_full() {
    let (runtime, session, fixture) = setup();
    fixture.sim.push_rx(0x10, false);
    fixture.sim.push_rx(0x11, false);
    fixture.sim.push_rx(0x12, true);

    let reply = dispatch(&runtime, &session, BOARD, Request::Read { length: 5 }).unwrap();
    assert_eq!(
        reply,
        Reply::Data {
            data: vec![0x10, 0x11, 0x12],
            end: true,
        }
    );
    // ENDはボードステータスにも反映される
    let board = runtime.board(BOARD).unwrap();
    assert!(board.status().test(BoardStatus::END));
}

#[test]
fn read_terminates_on_eos_match() {
    let (runtime, session, fixture) = setup();
    dispatch(
        &runtime,
        &session,
        BOARD,
        Request::SetEos {
            byte: b'\n',
            flags: EosFlags::REOS,
        },
    )
    .unwrap();
    fixture.sim.push_rx(b'a', false);
    fixture.sim.push_rx(b'b', false);
    fixture.sim.push_rx(b'\n', false);
    fixture.sim.push_rx(b'c', false);

    let reply = dispatch(&runtime, &session, BOARD, Request::Read { length: 10 }).unwrap();
    assert_eq!(
        reply,
        Reply::Data {
            data: vec![b'a', b'b', b'\n'],
            end: true,
        }
    );

    // ホールドオフで止まっていた残りのバイトは次の読み取りで届く
    let reply = dispatch(&runtime, &session, BOARD, Request::Read { length: 1 }).unwrap();
    assert_eq!(
        reply,
        Reply::Data {
            data: vec![b'c'],
            end: false,
        }
    );
}

#[test]
fn read_fills_buffer_without_end() {
    let (runtime, session, fixture) = setup();
    fixture.sim.push_rx(1, false);
    fixture.sim.push_rx(2, false);

    let reply = dispatch(&runtime, &session, BOARD, Request::Read { length: 2 }).unwrap();
    assert_eq!(
        reply,
        Reply::Data {
            data: vec![1, 2],
            end: false,
        }
    );
}

#[test]
fn timeout_reported_over_partial_read() {
    let (runtime, session, fixture) = setup();
    dispatch(&runtime, &session, BOARD, Request::SetTimeout { usec: 20_000 }).unwrap();
    fixture.sim.push_rx(0x55, false);

    // 2バイト目は到着しないのでタイムアウトが優先して報告される
    let board = runtime.board(BOARD).unwrap();
    let mut buffer = [0u8; 3];
    let err = bus::read(&board, session.cancel_token(), &mut buffer).unwrap_err();
    assert_eq!(err.error, GpibError::Timeout);
    assert_eq!(err.bytes, 1);
    assert_eq!(buffer[0], 0x55);
    assert!(board.status().test(BoardStatus::TIMO));
}

#[test]
fn command_bytes_pass_under_atn() {
    let (runtime, session, fixture) = setup();
    let reply = dispatch(
        &runtime,
        &session,
        BOARD,
        Request::Command {
            data: vec![bus::cmd::UNL, bus::cmd::mla(0), bus::cmd::mta(5)],
        },
    )
    .unwrap();
    assert_eq!(reply, Reply::Transfer { bytes: 3, end: false });
    assert_eq!(fixture.sim.talker(), Some(5));
    assert_eq!(fixture.sim.listeners(), vec![0]);
}

#[test]
fn control_mutex_is_exclusive_across_sessions() {
    let (runtime, session, _fixture) = setup();

    let other = Session::new(SessionCaps::empty());
    let err = dispatch(
        &runtime,
        &other,
        BOARD,
        Request::Command {
            data: vec![bus::cmd::UNL],
        },
    )
    .unwrap_err();
    assert_eq!(err.error, GpibError::PermissionDenied);

    dispatch(&runtime, &session, BOARD, Request::ReleaseControl).unwrap();
    dispatch(&runtime, &other, BOARD, Request::AcquireControl).unwrap();
    dispatch(&runtime, &other, BOARD, Request::ReleaseControl).unwrap();
}

#[test]
fn serial_poll_issues_addressing_sequence() {
    let (runtime, session, fixture) = setup();
    let addr = DeviceAddr::new(5, None).unwrap();
    let handle = match dispatch(&runtime, &session, BOARD, Request::OpenDevice { addr }).unwrap() {
        Reply::Handle(handle) => handle,
        other => panic!("unexpected reply {:?}", other),
    };
    fixture.sim.set_device_status(5, 0x41);

    let reply = dispatch(
        &runtime,
        &session,
        BOARD,
        Request::SerialPoll {
            handle,
            usec_timeout: 0,
        },
    )
    .unwrap();
    assert_eq!(reply, Reply::StatusByte(0x41));

    let commands = fixture.sim.commands();
    for expected in [
        bus::cmd::UNL,
        bus::cmd::mla(0),
        bus::cmd::SPE,
        bus::cmd::mta(5),
        bus::cmd::SPD,
        bus::cmd::UNT,
    ] {
        assert!(
            commands.contains(&expected),
            "command 0x{:02x} missing from {:?}",
            expected,
            commands
        );
    }
}

#[test]
fn autopoll_collects_status_and_handles_stuck_srq() {
    let (runtime, session, fixture) = setup();
    let addr = DeviceAddr::new(5, None).unwrap();
    dispatch(&runtime, &session, BOARD, Request::OpenDevice { addr }).unwrap();

    let board = runtime.board(BOARD).unwrap();
    let poller_session = Session::new(SessionCaps::empty());
    let poller = {
        let board = Arc::clone(&board);
        let id = poller_session.id();
        let cancel = poller_session.cancel_token().clone();
        std::thread::spawn(move || bus::autopoll(&board, id, &cancel))
    };

    // SRQを要求するデバイスがポールされ、キューへ収集される
    fixture.sim.set_device_status(5, 0x41);
    assert!(eventually(|| board.devices().num_status_bytes(addr) > 0));
    assert_eq!(board.devices().pop_status_byte(addr), Some(0x41));

    // 誰も引き取らないSRQはスタックSRQとして保留される
    fixture.sim.pulse_srq();
    assert!(eventually(|| board.stuck_srq()));

    // 新しいデバイスのオープンで保留が解除され、そのデバイスが
    // SRQを引き取る
    let addr2 = DeviceAddr::new(7, None).unwrap();
    fixture.sim.set_device_status(7, 0x50);
    dispatch(&runtime, &session, BOARD, Request::OpenDevice { addr: addr2 }).unwrap();
    assert!(eventually(|| board.devices().num_status_bytes(addr2) > 0));
    assert!(!board.stuck_srq());

    poller_session.cancel_token().cancel();
    assert_eq!(poller.join().unwrap(), Err(GpibError::Interrupted));
}

#[test]
fn transfer_error_reply_carries_partial_count() {
    let (runtime, session, fixture) = setup();
    dispatch(&runtime, &session, BOARD, Request::SetTimeout { usec: 20_000 }).unwrap();
    fixture.sim.push_rx(0x55, false);

    let err = dispatch(&runtime, &session, BOARD, Request::Read { length: 3 }).unwrap_err();
    assert_eq!(err.error, GpibError::Timeout);
    assert_eq!(err.bytes, 1);
}

#[test]
fn line_status_samples_bus_management_lines() {
    let (runtime, session, fixture) = setup();
    dispatch(&runtime, &session, BOARD, Request::RemoteEnable { enable: true }).unwrap();
    dispatch(
        &runtime,
        &session,
        BOARD,
        Request::TakeControl { synchronous: false },
    )
    .unwrap();

    let reply = dispatch(&runtime, &session, BOARD, Request::LineStatus).unwrap();
    let bits = match reply {
        Reply::Lines(bits) => bits,
        other => panic!("unexpected reply {:?}", other),
    };
    let lines = BusLines::from_bits_truncate(bits);
    assert!(lines.contains(BusLines::VALID_REN | BusLines::BUS_REN));
    assert!(lines.contains(BusLines::VALID_ATN | BusLines::BUS_ATN));
    assert!(!lines.contains(BusLines::BUS_IFC));
    assert!(!lines.contains(BusLines::BUS_SRQ));

    // デバイスがRQSを立てるとSRQラインがアサートされる
    fixture.sim.set_device_status(9, 0x41);
    let reply = dispatch(&runtime, &session, BOARD, Request::LineStatus).unwrap();
    let bits = match reply {
        Reply::Lines(bits) => bits,
        other => panic!("unexpected reply {:?}", other),
    };
    assert!(BusLines::from_bits_truncate(bits).contains(BusLines::BUS_SRQ));
}

#[test]
fn t1_delay_rounds_to_chip_step() {
    let (runtime, session, _fixture) = setup();
    dispatch(
        &runtime,
        &session,
        BOARD,
        Request::SetT1Delay { nano_sec: 1500 },
    )
    .unwrap();

    let reply = dispatch(&runtime, &session, BOARD, Request::BoardInfo).unwrap();
    let info = match reply {
        Reply::Info(info) => info,
        other => panic!("unexpected reply {:?}", other),
    };
    assert_eq!(info.t1_nano_sec, 1100);
}

#[test]
fn open_close_reference_counts() {
    let (runtime, session, _fixture) = setup();
    let addr = DeviceAddr::new(9, Some(2)).unwrap();

    let h1 = match dispatch(&runtime, &session, BOARD, Request::OpenDevice { addr }).unwrap() {
        Reply::Handle(handle) => handle,
        other => panic!("unexpected reply {:?}", other),
    };
    let h2 = match dispatch(&runtime, &session, BOARD, Request::OpenDevice { addr }).unwrap() {
        Reply::Handle(handle) => handle,
        other => panic!("unexpected reply {:?}", other),
    };

    let board = runtime.board(BOARD).unwrap();
    assert_eq!(board.devices().len(), 1);

    dispatch(&runtime, &session, BOARD, Request::CloseDevice { handle: h1 }).unwrap();
    assert_eq!(board.devices().len(), 1);
    dispatch(&runtime, &session, BOARD, Request::CloseDevice { handle: h2 }).unwrap();
    assert!(board.devices().is_empty());
}

#[test]
fn device_clear_reaches_event_queue_and_status() {
    let (runtime, session, fixture) = setup();
    let board = runtime.board(BOARD).unwrap();

    fixture.sim.pulse_device_clear();
    assert!(eventually(|| board.status().test(BoardStatus::DCAS)));
    let reply = dispatch(&runtime, &session, BOARD, Request::PopEvent).unwrap();
    assert_eq!(reply, Reply::Event(BusEvent::DeviceClear));
}

#[test]
fn wait_returns_on_status_bit() {
    let (runtime, session, fixture) = setup();
    let board = runtime.board(BOARD).unwrap();

    let waiter = {
        let board = Arc::clone(&board);
        let session_cancel = session.cancel_token().clone();
        std::thread::spawn(move || {
            bus::wait_for_status(
                &board,
                &session_cancel,
                BoardStatus::SRQI,
                BoardStatus::SRQI,
                0,
            )
        })
    };
    std::thread::sleep(Duration::from_millis(20));
    fixture.sim.pulse_srq();

    let status = waiter.join().unwrap().unwrap();
    assert!(status.contains(BoardStatus::SRQI));
    // clear_maskで消費済み
    assert!(!board.status().test(BoardStatus::SRQI));
}

#[test]
fn wait_times_out_with_timo_bit() {
    let (runtime, session, _fixture) = setup();
    let board = runtime.board(BOARD).unwrap();
    let status = bus::wait_for_status(
        &board,
        session.cancel_token(),
        BoardStatus::SRQI,
        BoardStatus::empty(),
        10_000,
    )
    .unwrap();
    assert!(status.contains(BoardStatus::TIMO));
}

#[test]
fn session_cleanup_releases_everything() {
    let (runtime, session, _fixture) = setup();
    let addr = DeviceAddr::new(3, None).unwrap();
    dispatch(&runtime, &session, BOARD, Request::OpenDevice { addr }).unwrap();

    let board = runtime.board(BOARD).unwrap();
    bus::cleanup_session(&board, &session).unwrap();
    assert!(board.devices().is_empty());
    assert_eq!(board.control_mutex().owner(), None);
    assert!(!board.is_online());
}

#[test]
fn offline_drops_events_and_open_state() {
    let (runtime, session, fixture) = setup();
    let board = runtime.board(BOARD).unwrap();
    fixture.sim.pulse_device_clear();
    assert!(eventually(|| board.num_events() > 0));

    dispatch(&runtime, &session, BOARD, Request::ReleaseControl).unwrap();
    dispatch(&runtime, &session, BOARD, Request::Offline).unwrap();
    assert!(!board.is_online());
    assert_eq!(board.num_events(), 0);
}
