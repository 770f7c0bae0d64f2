//! Scratch-buffer pool for the read path.
//!
//! Acquired buffers hand themselves back on drop, so steady-state reads
//! allocate nothing. The pool lives on the loop thread and is not shared.

use std::cell::RefCell;
use std::rc::Rc;

type Shelf = Rc<RefCell<Vec<Vec<u8>>>>;

pub(crate) struct BufferPool {
    shelf: Shelf,
    buf_size: usize,
}

impl BufferPool {
    pub(crate) fn new(initial_size: usize, buf_size: usize) -> Self {
        let shelf: Shelf = Rc::new(RefCell::new(
            (0..initial_size).map(|_| vec![0; buf_size]).collect(),
        ));
        BufferPool { shelf, buf_size }
    }

    pub(crate) fn acquire(&self) -> PooledBuffer {
        let mut buf = self
            .shelf
            .borrow_mut()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.buf_size));
        buf.clear();
        buf.resize(self.buf_size, 0);
        PooledBuffer {
            buf: Some(buf),
            shelf: Rc::clone(&self.shelf),
        }
    }
}

pub(crate) struct PooledBuffer {
    buf: Option<Vec<u8>>,
    shelf: Shelf,
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        self.buf.as_ref().unwrap()
    }
}

impl AsMut<[u8]> for PooledBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut().unwrap()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.shelf.borrow_mut().push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_return_on_drop() {
        let pool = BufferPool::new(1, 16);
        {
            let one = pool.acquire();
            let two = pool.acquire();
            assert_eq!(one.as_ref().len(), 16);
            assert_eq!(two.as_ref().len(), 16);
            assert_eq!(pool.shelf.borrow().len(), 0);
        }
        assert_eq!(pool.shelf.borrow().len(), 2);
    }

    #[test]
    fn reacquired_buffers_are_rezeroed() {
        let pool = BufferPool::new(1, 4);
        {
            let mut buf = pool.acquire();
            buf.as_mut().copy_from_slice(b"abcd");
        }
        let buf = pool.acquire();
        assert_eq!(buf.as_ref(), &[0, 0, 0, 0]);
    }
}
