use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::Path,
    thread,
};

use irc_relay_bot::{
    connection::SharedConnection,
    gate::{GateFile, SharedGate},
    shutdown::ShutdownFlag,
};

/// Appends a few bytes per call so unsynchronised writers would interleave.
struct Dribble(File);

impl Write for Dribble {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = buf.len().min(3);
        let written = self.0.write(&buf[..n])?;
        thread::yield_now();
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush()
    }
}

fn writer_thread(id: usize, gate_path: &Path, out: &Path) -> thread::JoinHandle<()> {
    let gate = SharedGate::open(gate_path).unwrap();
    let file = OpenOptions::new().append(true).open(out).unwrap();
    thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let conn = SharedConnection::from_writer(Dribble(file), Some(gate), ShutdownFlag::new());
            for n in 0..25 {
                conn.send(&format!("PRIVMSG #c :writer {id} line {n} end"))
                    .await
                    .unwrap();
            }
        });
    })
}

#[test]
fn independent_writers_never_interleave_lines() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("wire.log");
    File::create(&out).unwrap();
    let gate = GateFile::create().unwrap();

    let handles: Vec<_> = (0..4)
        .map(|id| writer_thread(id, gate.path(), &out))
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let text = std::fs::read_to_string(&out).unwrap();
    let lines: Vec<&str> = text.split("\r\n").filter(|line| !line.is_empty()).collect();
    assert_eq!(lines.len(), 100);
    for line in lines {
        assert!(line.starts_with("PRIVMSG #c :writer "), "{line:?}");
        assert!(line.ends_with(" end"), "{line:?}");
    }
}

#[test]
fn removed_gate_cannot_be_attached() {
    let gate = GateFile::create().unwrap();
    let path = gate.path().to_path_buf();
    gate.remove();
    assert!(SharedGate::open(path).is_err());
}
