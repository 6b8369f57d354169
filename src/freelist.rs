//! Per-slab freelist: an ordered sequence of free object addresses.
//!
//! The order is FIFO: frees append at the back, allocations pop from the front. `contains`
//! backs the double-free check on the free path.

use std::collections::VecDeque;

pub(crate) struct Freelist {
    addrs: VecDeque<usize>,
}

impl Freelist {
    pub fn new() -> Freelist {
        Freelist {
            addrs: VecDeque::new(),
        }
    }

    pub fn append(&mut self, addr: usize) {
        self.addrs.push_back(addr);
    }

    pub fn pop_front(&mut self) -> Option<usize> {
        self.addrs.pop_front()
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.addrs.contains(&addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let mut list = Freelist::new();
        list.append(0x1000);
        list.append(0x2000);
        list.append(0x3000);
        assert_eq!(list.len(), 3);
        assert_eq!(list.pop_front(), Some(0x1000));
        assert_eq!(list.pop_front(), Some(0x2000));
        list.append(0x1000);
        assert_eq!(list.pop_front(), Some(0x3000));
        assert_eq!(list.pop_front(), Some(0x1000));
        assert_eq!(list.pop_front(), None);
    }

    #[test]
    fn membership() {
        let mut list = Freelist::new();
        assert!(!list.contains(0x1000));
        list.append(0x1000);
        assert!(list.contains(0x1000));
        list.pop_front();
        assert!(!list.contains(0x1000));
    }
}
