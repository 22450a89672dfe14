//! Single-threaded TCP echo server over one-shot readiness waits.
//!
//! Run it, then: `printf hello | nc 127.0.0.1 7777`

use epollo::net::{TcpListener, TcpStream, WaitKind};
use epollo::{IoContext, WorkGuard};
use std::io;
use std::sync::Arc;

fn accept_next(listener: Arc<TcpListener>) {
    let again = listener.clone();
    let res = listener.async_accept(move |res| {
        match res {
            Ok((stream, peer)) => {
                println!("accepted {peer}");
                echo(Arc::new(stream));
            }
            Err(e) => eprintln!("accept failed: {e}"),
        }
        accept_next(again);
    });

    if let Err(e) = res {
        eprintln!("cannot arm accept: {e}");
    }
}

fn echo(stream: Arc<TcpStream>) {
    let inner = stream.clone();
    let res = stream.async_wait(WaitKind::Readable, move |res| {
        if res.is_err() {
            return;
        }

        let mut buf = [0u8; 4096];
        match inner.read(&mut buf) {
            // Peer closed; drop the stream.
            Ok(0) => {}
            Ok(n) => {
                let _ = inner.write(&buf[..n]);
                echo(inner.clone());
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => echo(inner.clone()),
            Err(e) => eprintln!("read failed: {e}"),
        }
    });

    if let Err(e) = res {
        eprintln!("cannot arm read: {e}");
    }
}

fn main() -> anyhow::Result<()> {
    let ctx = IoContext::try_new()?;
    let listener = Arc::new(TcpListener::bind(&ctx, "127.0.0.1:7777")?);
    println!("echoing on {}", listener.local_addr()?);

    accept_next(listener);

    let _guard = WorkGuard::new(&ctx);
    ctx.run()?;
    Ok(())
}
