//! Token arena with the four membership queues.
//!
//! Each token carries one intrusive link, so membership is a single tag and a
//! token can never sit on two queues. Moving a token unlinks it and appends it
//! to the destination in one call, updating both queue lengths together.

use crate::token::{Token, TokenId};

/// Queue a token currently belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Free,
    /// Issued or being prepared; outcome is `Active`.
    Active,
    /// Awaiting recovery, or parked by the hold-failed policy.
    TimedOut,
    /// Terminal outcome recorded; waiting for the owner to release it.
    Resumable,
}

impl QueueKind {
    pub const ALL: [QueueKind; 4] = [
        QueueKind::Free,
        QueueKind::Active,
        QueueKind::TimedOut,
        QueueKind::Resumable,
    ];

    fn index(self) -> usize {
        match self {
            QueueKind::Free => 0,
            QueueKind::Active => 1,
            QueueKind::TimedOut => 2,
            QueueKind::Resumable => 3,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Link {
    queue: QueueKind,
    prev: Option<TokenId>,
    next: Option<TokenId>,
}

#[derive(Clone, Copy, Debug, Default)]
struct List {
    head: Option<TokenId>,
    tail: Option<TokenId>,
    len: usize,
}

pub struct TokenRegistry {
    tokens: Vec<Token>,
    links: Vec<Link>,
    lists: [List; 4],
}

impl TokenRegistry {
    /// Create `count` tokens, all on the free queue in id order.
    pub fn new(count: u16) -> Self {
        let mut registry = Self {
            tokens: (0..count).map(Token::new).collect(),
            links: vec![
                Link {
                    queue: QueueKind::Free,
                    prev: None,
                    next: None,
                };
                count as usize
            ],
            lists: [List::default(); 4],
        };
        for id in 0..count {
            registry.push_back(id, QueueKind::Free);
        }
        registry
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn get(&self, id: TokenId) -> Option<&Token> {
        self.tokens.get(id as usize)
    }

    pub(crate) fn get_mut(&mut self, id: TokenId) -> Option<&mut Token> {
        self.tokens.get_mut(id as usize)
    }

    pub fn queue_of(&self, id: TokenId) -> Option<QueueKind> {
        self.links.get(id as usize).map(|link| link.queue)
    }

    pub fn depth(&self, queue: QueueKind) -> usize {
        self.lists[queue.index()].len
    }

    pub fn front(&self, queue: QueueKind) -> Option<TokenId> {
        self.lists[queue.index()].head
    }

    /// Iterate a queue front to back.
    pub fn iter(&self, queue: QueueKind) -> QueueIter<'_> {
        QueueIter {
            links: &self.links,
            cursor: self.lists[queue.index()].head,
        }
    }

    /// Snapshot of a queue, for loops that move tokens while walking.
    pub fn ids(&self, queue: QueueKind) -> Vec<TokenId> {
        self.iter(queue).collect()
    }

    /// Move `id` to the back of `to`. Moving onto its own queue requeues it at the back.
    pub fn move_to(&mut self, id: TokenId, to: QueueKind) {
        self.unlink(id);
        self.push_back(id, to);
    }

    /// Move `id` to the front of `to`.
    pub fn move_to_front(&mut self, id: TokenId, to: QueueKind) {
        self.unlink(id);
        let idx = id as usize;
        let list = &mut self.lists[to.index()];
        self.links[idx] = Link {
            queue: to,
            prev: None,
            next: list.head,
        };
        match list.head {
            Some(head) => self.links[head as usize].prev = Some(id),
            None => list.tail = Some(id),
        }
        list.head = Some(id);
        list.len += 1;
    }

    /// Queue lengths sum to the token count and every link agrees with its queue.
    pub fn check_partition(&self) -> bool {
        let mut seen = 0;
        for queue in QueueKind::ALL {
            let mut count = 0;
            for id in self.iter(queue) {
                if self.links[id as usize].queue != queue {
                    return false;
                }
                count += 1;
            }
            if count != self.depth(queue) {
                return false;
            }
            seen += count;
        }
        seen == self.tokens.len()
    }

    fn unlink(&mut self, id: TokenId) {
        let idx = id as usize;
        let Link { queue, prev, next } = self.links[idx];
        let list = &mut self.lists[queue.index()];
        match prev {
            Some(prev) => self.links[prev as usize].next = next,
            None => list.head = next,
        }
        match next {
            Some(next) => self.links[next as usize].prev = prev,
            None => list.tail = prev,
        }
        list.len -= 1;
        self.links[idx].prev = None;
        self.links[idx].next = None;
    }

    fn push_back(&mut self, id: TokenId, to: QueueKind) {
        let idx = id as usize;
        let list = &mut self.lists[to.index()];
        self.links[idx] = Link {
            queue: to,
            prev: list.tail,
            next: None,
        };
        match list.tail {
            Some(tail) => self.links[tail as usize].next = Some(id),
            None => list.head = Some(id),
        }
        list.tail = Some(id);
        list.len += 1;
    }
}

pub struct QueueIter<'a> {
    links: &'a [Link],
    cursor: Option<TokenId>,
}

impl Iterator for QueueIter<'_> {
    type Item = TokenId;

    fn next(&mut self) -> Option<TokenId> {
        let id = self.cursor?;
        self.cursor = self.links[id as usize].next;
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_all_free_in_order() {
        let registry = TokenRegistry::new(4);
        assert_eq!(registry.depth(QueueKind::Free), 4);
        assert_eq!(registry.ids(QueueKind::Free), vec![0, 1, 2, 3]);
        assert!(registry.check_partition());
    }

    #[test]
    fn moves_update_both_queues() {
        let mut registry = TokenRegistry::new(4);
        registry.move_to(2, QueueKind::Active);
        registry.move_to(0, QueueKind::Active);
        assert_eq!(registry.ids(QueueKind::Free), vec![1, 3]);
        assert_eq!(registry.ids(QueueKind::Active), vec![2, 0]);
        assert_eq!(registry.queue_of(2), Some(QueueKind::Active));

        registry.move_to(2, QueueKind::Resumable);
        assert_eq!(registry.ids(QueueKind::Active), vec![0]);
        assert_eq!(registry.depth(QueueKind::Resumable), 1);
        assert!(registry.check_partition());
    }

    #[test]
    fn move_to_front_undoes_a_take() {
        let mut registry = TokenRegistry::new(3);
        let id = registry.front(QueueKind::Free).unwrap();
        registry.move_to(id, QueueKind::Active);
        registry.move_to_front(id, QueueKind::Free);
        assert_eq!(registry.ids(QueueKind::Free), vec![0, 1, 2]);
        assert_eq!(registry.depth(QueueKind::Active), 0);
        assert!(registry.check_partition());
    }

    #[test]
    fn requeue_on_same_queue_moves_to_back() {
        let mut registry = TokenRegistry::new(3);
        registry.move_to(0, QueueKind::Free);
        assert_eq!(registry.ids(QueueKind::Free), vec![1, 2, 0]);
        assert_eq!(registry.depth(QueueKind::Free), 3);
    }
}
