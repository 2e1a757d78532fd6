#![cfg(target_os = "linux")]

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use serial_native::binding::{HostBuffer, SerialPort, Value};
use serial_native::ErrorKind;

mod util;
use util::{with_test_env, Pty};

fn open_pty(port: &SerialPort, pty: &Pty) -> Result<Value, serial_native::Error> {
    port.open(vec![
        pty.path_str().into(),
        9600.into(),
        8.into(),
        1.into(),
        0.into(),
        0.into(),
    ])
}

#[test]
fn open_missing_port() -> Result<(), Box<dyn std::error::Error>> {
    with_test_env(|port| {
        let err = port
            .open(vec![
                "fake-port".into(),
                9600.into(),
                8.into(),
                1.into(),
                0.into(),
                0.into(),
            ])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(port.dispatcher().pending(), 0);
        Ok(())
    })
}

#[test]
fn sync_write_to_loopback() -> Result<(), Box<dyn std::error::Error>> {
    let mut pty = Pty::open()?;
    with_test_env(|port| {
        let handle = open_pty(port, &pty)?;
        let n = port
            .write(vec![Value::Int(handle.as_int().unwrap()), HostBuffer::from(&b"hello"[..]).into()])?
            .as_int()
            .unwrap();
        assert!((0..=5).contains(&n), "{n}");
        if n > 0 {
            assert_eq!(pty.collect(n as usize)?, &b"hello"[..n as usize]);
        }
        port.close(vec![handle])?;
        Ok(())
    })
}

#[test]
fn async_read_from_loopback() -> Result<(), Box<dyn std::error::Error>> {
    let mut pty = Pty::open()?;
    let fired = Rc::new(Cell::new(0));
    let buffer = HostBuffer::zeroed(64);

    let seen = Rc::clone(&fired);
    let target = buffer.clone();
    let handle = with_test_env(|port| {
        let handle = open_pty(port, &pty)?.as_int().unwrap();
        pty.inject(b"ping")?;

        let pending = port.read(vec![
            Value::Int(handle),
            Value::Buffer(buffer.clone()),
            64.into(),
            Value::function(move |err, result| {
                assert!(err.is_none(), "{err:?}");
                let n = result.as_int().unwrap();
                assert!((0..=64).contains(&n), "{n}");
                assert_eq!(&target.to_vec()[..n as usize], &b"ping"[..n as usize]);
                seen.set(seen.get() + 1);
            }),
        ])?;
        assert!(pending.is_undefined());
        assert_eq!(fired.get(), 0);
        Ok(handle)
    })?;

    assert_eq!(fired.get(), 1);
    with_test_env(|port| {
        port.close(vec![Value::Int(handle)])?;
        Ok(())
    })
}

#[test]
fn concurrent_async_writes() -> Result<(), Box<dyn std::error::Error>> {
    const N: usize = 16;
    let mut pty = Pty::open()?;
    let counts = Rc::new(RefCell::new(Vec::new()));

    with_test_env(|port| {
        let handle = open_pty(port, &pty)?.as_int().unwrap();
        for len in 1..=N {
            let counts = Rc::clone(&counts);
            let payload = vec![b'x'; len];
            port.write(vec![
                Value::Int(handle),
                HostBuffer::from(&payload[..]).into(),
                Value::function(move |err, result| {
                    assert!(err.is_none(), "{err:?}");
                    counts.borrow_mut().push((len, result.as_int().unwrap()));
                }),
            ])?;
        }
        assert_eq!(port.dispatcher().pending(), N);
        port.dispatcher().run()?;

        let total: usize = counts.borrow().iter().map(|(_, n)| *n as usize).sum();
        assert_eq!(pty.collect(total)?, vec![b'x'; total]);
        port.close(vec![Value::Int(handle)])?;
        Ok(())
    })?;

    let counts = counts.borrow();
    assert_eq!(counts.len(), N);
    for (len, n) in counts.iter() {
        assert!(*n > 0 && *n as usize <= *len, "len={len} n={n}");
    }
    Ok(())
}

#[test]
fn oversized_length_is_rejected_before_submission() -> Result<(), Box<dyn std::error::Error>> {
    let pty = Pty::open()?;
    with_test_env(|port| {
        let handle = open_pty(port, &pty)?;
        let fired = Rc::new(Cell::new(false));
        let seen = Rc::clone(&fired);
        let err = port
            .read(vec![
                Value::Int(handle.as_int().unwrap()),
                HostBuffer::zeroed(8).into(),
                9.into(),
                Value::function(move |_, _| seen.set(true)),
            ])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(port.dispatcher().pending(), 0);
        assert!(!port.dispatcher().event_loop().has_pending_work());
        port.dispatcher().run()?;
        assert!(!fired.get());
        port.close(vec![handle])?;
        Ok(())
    })
}

#[test]
fn empty_read_is_not_an_error() -> Result<(), Box<dyn std::error::Error>> {
    let pty = Pty::open()?;
    with_test_env(|port| {
        let handle = open_pty(port, &pty)?;
        let n = port.read(vec![
            Value::Int(handle.as_int().unwrap()),
            HostBuffer::zeroed(16).into(),
            16.into(),
        ])?;
        assert_eq!(n.as_int(), Some(0));
        port.close(vec![handle])?;
        Ok(())
    })
}

#[test]
fn line_control_on_open_device() -> Result<(), Box<dyn std::error::Error>> {
    let pty = Pty::open()?;
    with_test_env(|port| {
        let handle = open_pty(port, &pty)?.as_int().unwrap();
        let effective = port.set_baud_rate(vec![Value::Int(handle), 19_200.into()])?;
        assert_eq!(effective.as_int(), Some(19_200));

        let err = port
            .set_baud_rate(vec![Value::Int(handle), 12_345.into()])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        // Pseudo-terminals have no modem lines.
        if let Err(err) = port.set_dtr(vec![Value::Int(handle), true.into()]) {
            assert!(
                matches!(err.kind(), ErrorKind::Unsupported | ErrorKind::InvalidArgument),
                "{err:?}"
            );
        }
        port.close(vec![Value::Int(handle)])?;
        Ok(())
    })
}

#[test]
fn exclusive_open() -> Result<(), Box<dyn std::error::Error>> {
    let pty = Pty::open()?;
    with_test_env(|port| {
        let handle = open_pty(port, &pty)?;
        let second = open_pty(port, &pty);
        // Root ignores TIOCEXCL.
        match second {
            Ok(other) => {
                port.close(vec![other])?;
            }
            Err(err) => assert_eq!(err.kind(), ErrorKind::AccessDenied),
        }
        port.close(vec![handle])?;
        Ok(())
    })
}
