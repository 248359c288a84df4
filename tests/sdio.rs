mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use common::*;
use parking_lot::Mutex;
use sdmmc_core::constant::*;
use sdmmc_core::{Controller, DeviceKind, Message, Reply, SdError, SdioFunc, SdioHost, SdioIrqHandler};

fn sdio_slot(index: u32) -> (Arc<Controller>, Arc<Mutex<Card>>) {
    let (host, card, _) = MockHost::new(Card::sdio());
    let ctrl = Controller::add(config(index, DeviceKind::Sdio), Box::new(host), None).unwrap();
    ctrl.plug().unwrap();
    card.lock().clear_log();
    (ctrl, card)
}

#[test]
fn open_checks_function_and_device() {
    let (ctrl, _) = sdio_slot(40);
    assert!(matches!(SdioFunc::open(40, 0), Err(SdError::InvalidParameter)));
    assert!(matches!(SdioFunc::open(40, 8), Err(SdError::InvalidParameter)));
    assert!(matches!(SdioFunc::open(40, 3), Err(SdError::InvalidParameter)));
    assert!(matches!(SdioFunc::open(99, 1), Err(SdError::NoDevice)));
    let func = SdioFunc::open(40, 1).unwrap();
    assert_eq!(func.info().num, 1);
    // no memory side on an I/O-only card
    assert!(matches!(ctrl.device_handle(), Err(SdError::NoDevice)));

    ctrl.unplug().unwrap();
    assert!(matches!(func.claim_host(), Err(SdError::NoDevice)));
    assert!(matches!(SdioFunc::open(40, 1), Err(SdError::NoDevice)));
    Controller::remove(40).unwrap();
}

#[test]
fn enable_times_out_when_function_never_ready() {
    let (ctrl, card) = sdio_slot(41);
    card.lock().ready_mask = 0;
    let func = SdioFunc::open(41, 1).unwrap();
    let mut host = func.claim_host().unwrap();

    let mut info = host.common_info();
    assert_eq!(info.enable_timeout_ms, 20);
    info.enable_timeout_ms = 5;
    host.set_common_info(&info).unwrap();
    assert_eq!(host.enable_func(), Err(SdError::Timeout));

    let mut wrong = info;
    wrong.func_num = 2;
    assert_eq!(host.set_common_info(&wrong), Err(SdError::InvalidParameter));
    drop(host);

    card.lock().ready_mask = 0xFE;
    let mut host = func.claim_host().unwrap();
    host.enable_func().unwrap();
    assert_eq!(host.read_func0(SDIO_CCCR_IO_READY).unwrap() & 0x02, 0x02);
    host.disable_func().unwrap();
    assert_eq!(host.read_func0(SDIO_CCCR_IO_ENABLE).unwrap() & 0x02, 0);
    host.release();
    Controller::remove(41).unwrap();
}

#[test]
fn block_size_is_programmed_into_fbr() {
    let (ctrl, card) = sdio_slot(42);
    let func = SdioFunc::open(42, 1).unwrap();
    let mut host = func.claim_host().unwrap();
    assert_eq!(host.set_block_size(512), Err(SdError::InvalidParameter));
    host.set_block_size(0x40).unwrap();
    assert_eq!(host.common_info().cur_blk_size, 0x40);
    host.set_block_size(0).unwrap();
    assert_eq!(host.common_info().cur_blk_size, 256);
    drop(host);

    let card = card.lock();
    assert_eq!(card.reg(0, 0x110), 0x00);
    assert_eq!(card.reg(0, 0x111), 0x01);
    drop(card);
    let _ = ctrl;
    Controller::remove(42).unwrap();
}

#[test]
fn register_and_stream_access() {
    let (ctrl, card) = sdio_slot(43);
    let func = SdioFunc::open(43, 1).unwrap();
    let mut host = func.claim_host().unwrap();

    host.write_byte(0x10, 0xA5).unwrap();
    assert_eq!(host.read_byte(0x10).unwrap(), 0xA5);
    host.write_func0(0xF2, 0x33).unwrap();
    assert_eq!(host.read_func0(0xF2).unwrap(), 0x33);
    assert_eq!(host.write_func0(SDIO_CCCR_IO_ENABLE, 0xFF), Err(SdError::InvalidParameter));

    host.set_block_size(0).unwrap();
    card.lock().clear_log();
    let data: Vec<u8> = (0..600u32).map(|i| i as u8).collect();
    host.write_bytes(0x100, &data).unwrap();
    assert_eq!(
        card.lock().ext_log,
        vec![(1, 0x100, true, 512), (1, 0x300, false, 88)]
    );
    let mut back = vec![0u8; 600];
    host.read_bytes(0x100, &mut back).unwrap();
    assert_eq!(back, data);

    card.lock().clear_log();
    host.write_fixed(0x20, &[1, 2, 3]).unwrap();
    assert_eq!(card.lock().reg(1, 0x20), 3);
    let mut fifo = [0u8; 4];
    host.read_fixed(0x20, &mut fifo).unwrap();
    assert_eq!(fifo, [3; 4]);

    let (a, b) = ([7u8; 100], [9u8; 28]);
    host.write_scatter(0x30, vec![&a[..], &b[..]]).unwrap();
    assert_eq!(card.lock().ext_log.last(), Some(&(1, 0x30, false, 128)));
    let (mut x, mut y) = ([0u8; 400], [0u8; 112]);
    host.read_scatter(0x30, vec![&mut x[..], &mut y[..]]).unwrap();
    assert_eq!(card.lock().ext_log.last(), Some(&(1, 0x30, true, 512)));
    assert!(x.iter().chain(y.iter()).all(|&v| v == 9));

    let odd = [0u8; 300];
    assert_eq!(host.write_scatter(0x30, vec![&odd[..]]), Err(SdError::InvalidParameter));
    drop(host);
    let _ = ctrl;
    Controller::remove(43).unwrap();
}

#[test]
fn single_claimed_function_takes_fast_path() {
    let (ctrl, card) = sdio_slot(44);
    let func = SdioFunc::open(44, 1).unwrap();
    let hits = Arc::new(AtomicU32::new(0));
    let handler: Arc<dyn SdioIrqHandler> = {
        let hits = hits.clone();
        Arc::new(move |host: &mut SdioHost<'_>| {
            assert_eq!(host.func_num(), 1);
            hits.fetch_add(1, Ordering::AcqRel);
        })
    };
    {
        let mut host = func.claim_host().unwrap();
        host.claim_irq(handler.clone()).unwrap();
        assert_eq!(host.claim_irq(handler), Err(SdError::DeviceBusy));
        assert!(host.common_info().irq_claimed);
    }
    let int_enable = card.lock().reg(0, SDIO_CCCR_INT_ENABLE);
    assert_eq!(int_enable, SDIO_CCCR_INT_MASTER | 0x02);

    card.lock().clear_log();
    ctrl.irq_notifier().notify();
    assert!(eventually(|| hits.load(Ordering::Acquire) == 1));
    // one claimant, so INT_PENDING is never consulted
    assert!(
        !card
            .lock()
            .log
            .iter()
            .any(|&(op, arg)| op == SDIO_RW_DIRECT && (arg >> 9) & 0x1FFFF == SDIO_CCCR_INT_PENDING)
    );

    func.claim_host().unwrap().release_irq().unwrap();
    assert_eq!(card.lock().reg(0, SDIO_CCCR_INT_ENABLE), 0);
    Controller::remove(44).unwrap();
}

#[test]
fn pending_bits_select_handlers() {
    let (ctrl, card) = sdio_slot(45);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let funcs: Vec<SdioFunc> = [1, 2].iter().map(|&n| SdioFunc::open(45, n).unwrap()).collect();
    for func in &funcs {
        let seen = seen.clone();
        func.claim_host()
            .unwrap()
            .claim_irq(Arc::new(move |host: &mut SdioHost<'_>| {
                seen.lock().push(host.func_num());
            }))
            .unwrap();
    }

    card.lock().regs.insert((0, SDIO_CCCR_INT_PENDING), 1 << 2);
    ctrl.irq_notifier().notify();
    assert!(eventually(|| seen.lock().len() == 1));
    assert_eq!(*seen.lock(), vec![2]);

    card.lock().regs.insert((0, SDIO_CCCR_INT_PENDING), (1 << 1) | (1 << 2));
    ctrl.irq_notifier().notify();
    assert!(eventually(|| seen.lock().len() == 3));
    assert_eq!(&seen.lock()[1..], &[1, 2]);

    for func in &funcs {
        func.claim_host().unwrap().release_irq().unwrap();
    }
    Controller::remove(45).unwrap();
}

#[test]
fn queued_plug_then_rescan_keeps_device() {
    let (host, card, _) = MockHost::new(Card::sdio());
    let ctrl = Controller::add(config(46, DeviceKind::Sdio), Box::new(host), None).unwrap();
    ctrl.post(Message::Plug).unwrap();
    assert_eq!(ctrl.call(Message::SdioRescan), Ok(Reply::Done));
    let dev = ctrl.device().unwrap();
    assert!(dev.is_present());

    card.lock().clear_log();
    ctrl.rescan_sdio().unwrap();
    assert!(Arc::ptr_eq(&dev, &ctrl.device().unwrap()));
    let log = card.lock().opcodes();
    assert_eq!(log[0], SDIO_RW_DIRECT);
    assert!(log.contains(&SDIO_SEND_OP_COND));
    assert!(!log.contains(&MMC_ALL_SEND_CID));
    Controller::remove(46).unwrap();
}

#[test]
fn rescan_reenumerates_unresponsive_card() {
    let (ctrl, card) = sdio_slot(47);
    let before = ctrl.device().unwrap();
    card.lock().fail_cmd52 = MMC_CMD_DEFAULT_RETRY;
    ctrl.rescan_sdio().unwrap();

    let after = ctrl.device().unwrap();
    assert!(!Arc::ptr_eq(&before, &after));
    assert!(!before.is_present());
    assert!(after.is_present());
    assert!(card.lock().opcodes().contains(&SDIO_SEND_OP_COND));
    Controller::remove(47).unwrap();
}

#[test]
fn rescan_of_memory_card_is_refused() {
    let (host, _, _) = MockHost::new(Card::sd(1024));
    let ctrl = Controller::add(config(48, DeviceKind::Sd), Box::new(host), None).unwrap();
    ctrl.plug().unwrap();
    assert_eq!(ctrl.rescan_sdio(), Err(SdError::NotSupported));
    Controller::remove(48).unwrap();
}
