//! Scoped read/write/accept/connect helpers built on top of
//! [`Reactor::sched`]: each one reschedules itself on the reactor until
//! its operation completes, so the caller only ever sees one final
//! callback.
//!
//! These need to reschedule themselves from inside their own completion
//! handler, and a `Handler` is `'static` (it can't borrow the `Reactor`
//! that holds it), so every helper here takes a `Rc<RefCell<Reactor>>`
//! rather than the core's plain `&mut Reactor`.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::error::Status;
use crate::mask::EventKind;
use crate::node::Handler;
use crate::reactor::Reactor;

pub type SharedReactor = Rc<RefCell<Reactor>>;

type Completion = Box<dyn FnMut(Status, usize)>;

fn finish(done: &Rc<RefCell<Option<Completion>>>, status: Status, n: usize) {
    if let Some(mut f) = done.borrow_mut().take() {
        f(status, n);
    }
}

fn would_block(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
}

/// Attempt a single non-blocking read into `buf[offset..]`. A spurious
/// wakeup (`EWOULDBLOCK`) reschedules transparently; any other outcome —
/// a successful read of 1 or more bytes, `0` (EOF), or a real error —
/// invokes `on_done` exactly once.
pub fn read_some(
    reactor: SharedReactor,
    fd: RawFd,
    buf: Rc<RefCell<Vec<u8>>>,
    offset: usize,
    on_done: impl FnMut(Status, usize) + 'static,
) -> Status {
    let done: Rc<RefCell<Option<Completion>>> = Rc::new(RefCell::new(Some(Box::new(on_done))));
    schedule_read(reactor, fd, buf, offset, done)
}

fn schedule_read(
    reactor: SharedReactor,
    fd: RawFd,
    buf: Rc<RefCell<Vec<u8>>>,
    offset: usize,
    done: Rc<RefCell<Option<Completion>>>,
) -> Status {
    let sched_target = reactor.clone();
    let handler: Handler = Box::new(move || {
        let attempt = {
            let mut b = buf.borrow_mut();
            let slice = &mut b[offset..];
            let rc = unsafe { libc::read(fd, slice.as_mut_ptr() as *mut libc::c_void, slice.len()) };
            if rc >= 0 {
                Ok(rc as usize)
            } else {
                Err(std::io::Error::last_os_error())
            }
        };
        match attempt {
            Ok(0) => finish(&done, Status::Eof, 0),
            Ok(n) => finish(&done, Status::Ok, n),
            Err(e) if would_block(&e) => {
                schedule_read(reactor.clone(), fd, buf.clone(), offset, done.clone());
            }
            Err(_) => finish(&done, Status::SysFail, 0),
        }
    });
    sched_target.borrow_mut().sched(fd, EventKind::Readable, handler, None)
}

/// Like [`read_some`] but retries until the whole buffer has been filled,
/// EOF is hit, or an error occurs. `on_done`'s count is the total number
/// of bytes actually read.
pub fn read_exact(
    reactor: SharedReactor,
    fd: RawFd,
    buf: Rc<RefCell<Vec<u8>>>,
    mut on_done: impl FnMut(Status, usize) + 'static,
) -> Status {
    let total_len = buf.borrow().len();
    read_loop(reactor, fd, buf, 0, total_len, Box::new(move |status, n| on_done(status, n)))
}

fn read_loop(
    reactor: SharedReactor,
    fd: RawFd,
    buf: Rc<RefCell<Vec<u8>>>,
    so_far: usize,
    total_len: usize,
    mut on_done: Completion,
) -> Status {
    if so_far >= total_len {
        on_done(Status::Ok, so_far);
        return Status::Ok;
    }
    let buf2 = buf.clone();
    read_some(reactor.clone(), fd, buf, so_far, move |status, n| match status {
        Status::Ok => {
            let got = so_far + n;
            if got >= total_len {
                on_done(Status::Ok, got);
            } else {
                read_loop(reactor.clone(), fd, buf2.clone(), got, total_len, std::mem::replace(&mut on_done, Box::new(|_, _| {})));
            }
        }
        other => on_done(other, so_far),
    })
}

/// Attempt a single non-blocking write from `buf[offset..]`.
pub fn write_some(
    reactor: SharedReactor,
    fd: RawFd,
    buf: Rc<RefCell<Vec<u8>>>,
    offset: usize,
    on_done: impl FnMut(Status, usize) + 'static,
) -> Status {
    let done: Rc<RefCell<Option<Completion>>> = Rc::new(RefCell::new(Some(Box::new(on_done))));
    schedule_write(reactor, fd, buf, offset, done)
}

fn schedule_write(
    reactor: SharedReactor,
    fd: RawFd,
    buf: Rc<RefCell<Vec<u8>>>,
    offset: usize,
    done: Rc<RefCell<Option<Completion>>>,
) -> Status {
    let sched_target = reactor.clone();
    let handler: Handler = Box::new(move || {
        let attempt = {
            let b = buf.borrow();
            let slice = &b[offset..];
            let rc = unsafe { libc::write(fd, slice.as_ptr() as *const libc::c_void, slice.len()) };
            if rc >= 0 {
                Ok(rc as usize)
            } else {
                Err(std::io::Error::last_os_error())
            }
        };
        match attempt {
            Ok(n) => finish(&done, Status::Ok, n),
            Err(e) if would_block(&e) => {
                schedule_write(reactor.clone(), fd, buf.clone(), offset, done.clone());
            }
            Err(_) => finish(&done, Status::SysFail, 0),
        }
    });
    sched_target.borrow_mut().sched(fd, EventKind::Writable, handler, None)
}

/// Like [`write_some`] but retries until the whole buffer has been
/// written or an error occurs.
pub fn write_exact(
    reactor: SharedReactor,
    fd: RawFd,
    buf: Rc<RefCell<Vec<u8>>>,
    mut on_done: impl FnMut(Status, usize) + 'static,
) -> Status {
    let total_len = buf.borrow().len();
    write_loop(reactor, fd, buf, 0, total_len, Box::new(move |status, n| on_done(status, n)))
}

fn write_loop(
    reactor: SharedReactor,
    fd: RawFd,
    buf: Rc<RefCell<Vec<u8>>>,
    so_far: usize,
    total_len: usize,
    mut on_done: Completion,
) -> Status {
    if so_far >= total_len {
        on_done(Status::Ok, so_far);
        return Status::Ok;
    }
    let buf2 = buf.clone();
    write_some(reactor.clone(), fd, buf, so_far, move |status, n| match status {
        Status::Ok => {
            let got = so_far + n;
            if got >= total_len {
                on_done(Status::Ok, got);
            } else {
                write_loop(reactor.clone(), fd, buf2.clone(), got, total_len, std::mem::replace(&mut on_done, Box::new(|_, _| {})));
            }
        }
        other => on_done(other, so_far),
    })
}

/// Accept a single connection on a non-blocking listening socket.
pub fn accept(
    reactor: SharedReactor,
    listen_fd: RawFd,
    mut on_done: impl FnMut(Status, RawFd) + 'static,
) -> Status {
    let sched_target = reactor.clone();
    let handler: Handler = Box::new(move || {
        let rc = unsafe { libc::accept(listen_fd, std::ptr::null_mut(), std::ptr::null_mut()) };
        if rc >= 0 {
            set_nonblocking(rc);
            on_done(Status::Ok, rc);
        } else {
            let err = std::io::Error::last_os_error();
            if would_block(&err) {
                accept(reactor.clone(), listen_fd, on_done);
            } else {
                on_done(Status::SysFail, -1);
            }
        }
    });
    sched_target.borrow_mut().sched(listen_fd, EventKind::Readable, handler, None)
}

/// Connect a non-blocking socket, resolving completion via
/// `getsockopt(SOL_SOCKET, SO_ERROR)` once it becomes writable (the
/// standard non-blocking-connect completion check).
pub fn connect(
    reactor: SharedReactor,
    fd: RawFd,
    addr: &SocketAddr,
    mut on_done: impl FnMut(Status) + 'static,
) -> Status {
    set_nonblocking(fd);
    let (sockaddr, len) = to_sockaddr(addr);
    let rc = unsafe { libc::connect(fd, &sockaddr as *const _ as *const libc::sockaddr, len) };
    if rc == 0 {
        on_done(Status::Ok);
        return Status::Ok;
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::EINPROGRESS) {
        on_done(Status::SysFail);
        return Status::SysFail;
    }

    let handler: Handler = Box::new(move || {
        let mut errval: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut errval as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if rc == 0 && errval == 0 {
            on_done(Status::Ok);
        } else {
            on_done(Status::SysFail);
        }
    });
    reactor.borrow_mut().sched(fd, EventKind::Writable, handler, None)
}

fn set_nonblocking(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
}

fn to_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    };
    (storage, len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn pipe_pair() -> (RawFd, RawFd) {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        set_nonblocking(fds[0]);
        set_nonblocking(fds[1]);
        (fds[0], fds[1])
    }

    fn write_raw(fd: RawFd, data: &[u8]) {
        let rc = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
        assert_eq!(rc, data.len() as isize);
    }

    #[test]
    fn read_exact_collects_across_multiple_writes() {
        let (rd, wr) = pipe_pair();
        let reactor = Rc::new(RefCell::new(Reactor::default()));
        let buf = Rc::new(RefCell::new(vec![0u8; 5]));
        let got = Rc::new(RefCell::new(None));
        let got2 = got.clone();

        read_exact(reactor.clone(), rd, buf.clone(), move |status, n| {
            *got2.borrow_mut() = Some((status, n));
        });

        write_raw(wr, b"ab");
        write_raw(wr, b"cde");

        reactor.borrow_mut().run();

        assert_eq!(*got.borrow(), Some((Status::Ok, 5)));
        assert_eq!(&*buf.borrow(), b"abcde");
    }
}
