use alloc::vec::Vec;

/// Doubly linked list over slot indices `0..n`.
/// Slots `n` and `n + 1` are the head and tail sentinels.
pub struct IndexLink {
    n: usize,
    le_next: Vec<Option<usize>>,
    le_prev: Vec<Option<usize>>,
    rem: usize
}

/// iterator
pub struct IndexIterator<'a> {
    index_link: &'a IndexLink,
    index: usize,
}

impl IndexLink {
    /// create an empty list holding indices below `n`
    #[inline]
    pub fn new(n: usize) -> Self {
        let occupied = n + 2;
        let mut link = IndexLink {
            n,
            le_next: Vec::with_capacity(occupied),
            le_prev: Vec::with_capacity(occupied),
            rem: 0
        };
        link.le_next.resize(occupied, None);
        link.le_prev.resize(occupied, None);
        link.le_next[n] = Some(n + 1);
        link.le_prev[n + 1] = Some(n);
        link
    }

    /// check if empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.le_next[self.n] == Some(self.n + 1)
    }

    /// first index
    #[inline]
    pub fn first(&self) -> Option<usize> {
        self.le_next[self.n].filter(|&x| x != self.n + 1)
    }

    /// check membership
    #[inline]
    pub fn contains(&self, elm: usize) -> bool {
        self.le_prev[elm].is_some()
    }

    /// insert after an element index
    #[inline]
    pub fn insert_after(&mut self, listelm: usize, elm: usize) {
        self.le_next[elm] = self.le_next[listelm];
        if let Some(x) = self.le_next[listelm] {
            self.le_prev[x] = Some(elm);
        }
        self.le_next[listelm] = Some(elm);
        self.le_prev[elm] = Some(listelm);
        self.rem += 1;
    }

    /// insert before an element index
    #[inline]
    pub fn insert_before(&mut self, listelm: usize, elm: usize) {
        self.le_prev[elm] = self.le_prev[listelm];
        self.le_next[elm] = Some(listelm);
        if let Some(x) = self.le_prev[listelm] {
            self.le_next[x] = Some(elm);
        }
        self.le_prev[listelm] = Some(elm);
        self.rem += 1;
    }

    #[inline]
    pub fn insert_head(&mut self, elm: usize) {
        self.insert_after(self.n, elm);
    }

    #[inline]
    pub fn insert_tail(&mut self, elm: usize) {
        self.insert_before(self.n + 1, elm);
    }

    /// remove an index from list, no-op if it is not linked
    #[inline]
    pub fn remove(&mut self, elm: usize) {
        if !self.contains(elm) {
            return;
        }
        if let Some(x) = self.le_next[elm] {
            self.le_prev[x] = self.le_prev[elm];
        }
        if let Some(x) = self.le_prev[elm] {
            self.le_next[x] = self.le_next[elm];
        }
        self.le_next[elm] = None;
        self.le_prev[elm] = None;
        self.rem -= 1;
    }

    /// pop the first index
    #[inline]
    pub fn pop_head(&mut self) -> Option<usize> {
        let first = self.first()?;
        self.remove(first);
        Some(first)
    }

    #[inline]
    pub fn iter(&self) -> IndexIterator {
        IndexIterator {
            index_link: self,
            index: self.n
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.rem
    }
}

impl<'a> Iterator for IndexIterator<'a> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        match self.index_link.le_next[self.index] {
            Some(x) => {
                if x == self.index_link.n + 1 {
                    None
                } else {
                    self.index = x;
                    Some(x)
                }
            },
            None => None
        }
    }
}
