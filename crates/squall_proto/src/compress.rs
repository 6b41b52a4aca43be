//! Per-datagram compression.
//!
//! A host may install a [`Compressor`] to shrink the command block of each
//! outgoing datagram; both ends of a connection must agree on the codec.
//! The default is [`RangeCoder`], an adaptive range coder with an order-2
//! PPM model: each byte is predicted first by the context of the two
//! preceding bytes, falling back through shorter contexts (with explicit
//! escape symbols) down to an order-0 root context that can always encode.
//!
//! The model lives in a bounded arena of [`Symbol`] slots. Each slot is
//! both a node in one context's binary frequency tree (`left`/`right`,
//! with `under` holding the count of the node plus its entire left subtree)
//! and the head of the next-deeper context (`symbols`, `escapes`, `total`).
//! When the arena fills, the model is discarded and rebuilt; the encoder
//! and decoder allocate in lockstep, so both rebuild at the same input
//! position.

/// Compresses the command block of outgoing datagrams.
pub trait Compressor {
    /// Compresses up to `in_limit` bytes, gathered from `input` in order,
    /// into `output`.
    ///
    /// Returns the number of bytes written, or 0 if the data could not be
    /// compressed into `output`. A 0 return is not an error; the caller
    /// sends the original bytes instead.
    fn compress(&mut self, input: &[&[u8]], in_limit: usize, output: &mut [u8]) -> usize;

    /// Decompresses `input` into `output`.
    ///
    /// Returns the number of bytes written, or 0 if the stream was
    /// malformed or `output` was too small.
    fn decompress(&mut self, input: &[u8], output: &mut [u8]) -> usize;
}

const RANGE_TOP: u32 = 1 << 24;
const RANGE_BOTTOM: u32 = 1 << 16;

// Root (order-0) context tuning: every byte value keeps an implicit floor
// count of CONTEXT_SYMBOL_MINIMUM, so the root can always encode and its
// single escape slot only ever terminates the stream.
const CONTEXT_SYMBOL_DELTA: u16 = 3;
const CONTEXT_SYMBOL_MINIMUM: u16 = 1;
const CONTEXT_ESCAPE_MINIMUM: u16 = 1;

// Higher-order context tuning: no floor counts, so unseen bytes escape to
// the next-shorter context.
const SUBCONTEXT_ORDER: usize = 2;
const SUBCONTEXT_SYMBOL_DELTA: u16 = 2;
const SUBCONTEXT_ESCAPE_DELTA: u16 = 5;

// Rescale before a symbol count can overflow its byte, or a context total
// can overflow the range division.
const TOTAL_CAP: u16 = (RANGE_BOTTOM - 0x100) as u16;

const ARENA: usize = 4096;
/// Index of the root context; also the null value for tree / parent links,
/// which is unambiguous because the root is never anyone's child.
const ROOT: u16 = 0;

#[derive(Debug, Clone, Copy, Default)]
struct Symbol {
    value: u8,
    count: u8,
    /// Count of this node plus everything in its left subtree.
    under: u16,
    left: u16,
    right: u16,
    /// Frequency-tree root of the context this symbol opens.
    symbols: u16,
    escapes: u16,
    total: u16,
    /// Symbol for the same value in the next-shorter context.
    parent: u16,
}

/// The default [`Compressor`]: an order-2 adaptive PPM range coder.
pub struct RangeCoder {
    arena: Box<[Symbol; ARENA]>,
    next: usize,
}

impl core::fmt::Debug for RangeCoder {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RangeCoder")
            .field("symbols_in_use", &self.next)
            .finish()
    }
}

impl Default for RangeCoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Where to write the arena index of the symbol chosen for the current
/// byte: either the `predicted` cursor itself (deepest context) or the
/// `parent` link of the previously chosen symbol.
#[derive(Debug, Clone, Copy)]
enum Link {
    Predicted,
    Parent(u16),
}

impl RangeCoder {
    /// Creates a coder with a fresh model.
    #[must_use]
    pub fn new() -> Self {
        Self {
            arena: vec![Symbol::default(); ARENA]
                .into_boxed_slice()
                .try_into()
                .unwrap_or_else(|_| unreachable!()),
            next: 0,
        }
    }

    fn create(&mut self, value: u8, count: u8) -> u16 {
        let index = self.next;
        self.next += 1;
        self.arena[index] = Symbol {
            value,
            count,
            under: u16::from(count),
            ..Symbol::default()
        };
        index as u16
    }

    fn create_root(&mut self) {
        self.next = 0;
        let root = self.create(0, 0);
        self.arena[root as usize].escapes = CONTEXT_ESCAPE_MINIMUM;
        self.arena[root as usize].total = CONTEXT_ESCAPE_MINIMUM + 256 * CONTEXT_SYMBOL_MINIMUM;
    }

    fn set_link(&mut self, link: Link, symbol: u16, predicted: &mut u16) {
        match link {
            Link::Predicted => *predicted = symbol,
            Link::Parent(of) => self.arena[of as usize].parent = symbol,
        }
    }

    /// Finds or inserts `value` in `context`'s frequency tree, applying
    /// `update` to its count.
    ///
    /// Returns `(symbol, under, count)` where `under` and `count` describe
    /// the symbol's interval *before* the update: `under` is the cumulative
    /// weight of all smaller values (including the `minimum` floor) and
    /// `count` is the symbol's weight, 0 meaning the value was unseen in
    /// this context.
    fn tree_update(
        &mut self,
        context: u16,
        value: u8,
        update: u8,
        minimum: u16,
    ) -> (u16, u16, u16) {
        let mut under = u16::from(value) * minimum;
        let mut count = minimum;

        if self.arena[context as usize].symbols == 0 {
            let symbol = self.create(value, update);
            self.arena[context as usize].symbols = symbol;
            return (symbol, under, count);
        }

        let mut node = self.arena[context as usize].symbols;
        loop {
            let node_value = self.arena[node as usize].value;
            if value < node_value {
                self.arena[node as usize].under += u16::from(update);
                let left = self.arena[node as usize].left;
                if left != 0 {
                    node = left;
                    continue;
                }
                let symbol = self.create(value, update);
                self.arena[node as usize].left = symbol;
                return (symbol, under, count);
            } else if value > node_value {
                under += self.arena[node as usize].under;
                let right = self.arena[node as usize].right;
                if right != 0 {
                    node = right;
                    continue;
                }
                let symbol = self.create(value, update);
                self.arena[node as usize].right = symbol;
                return (symbol, under, count);
            }
            count += u16::from(self.arena[node as usize].count);
            under += self.arena[node as usize].under - u16::from(self.arena[node as usize].count);
            self.arena[node as usize].under += u16::from(update);
            self.arena[node as usize].count += update;
            return (node, under, count);
        }
    }

    /// Finds the symbol of `context` whose interval covers `code` (counted
    /// past the escape region), applying `update` to its count.
    ///
    /// When `minimum` is nonzero and `code` lands in the floor interval of
    /// an unseen value, that value's symbol is created. With a zero
    /// `minimum` such a landing means the stream is corrupt, and `None` is
    /// returned.
    fn tree_decode(
        &mut self,
        context: u16,
        code: u16,
        update: u8,
        minimum: u16,
    ) -> Option<(u16, u8, u16, u16)> {
        let mut under = 0u16;

        if self.arena[context as usize].symbols == 0 {
            if minimum == 0 {
                return None;
            }
            let value = (code / minimum) as u8;
            let under = code - code % minimum;
            let symbol = self.create(value, update);
            self.arena[context as usize].symbols = symbol;
            return Some((symbol, value, under, minimum));
        }

        let mut node = self.arena[context as usize].symbols;
        loop {
            let node_value = self.arena[node as usize].value;
            let node_count = u16::from(self.arena[node as usize].count);
            let node_under = self.arena[node as usize].under;
            let after = under + node_under + (u16::from(node_value) + 1) * minimum;
            let before = node_count + minimum;

            if code >= after {
                under += node_under;
                let right = self.arena[node as usize].right;
                if right != 0 {
                    node = right;
                    continue;
                }
                if minimum == 0 {
                    return None;
                }
                let value = (u16::from(node_value) + 1 + (code - after) / minimum) as u8;
                let under = code - (code - after) % minimum;
                let symbol = self.create(value, update);
                self.arena[node as usize].right = symbol;
                return Some((symbol, value, under, minimum));
            } else if code < after - before {
                self.arena[node as usize].under += u16::from(update);
                let left = self.arena[node as usize].left;
                if left != 0 {
                    node = left;
                    continue;
                }
                if minimum == 0 {
                    return None;
                }
                let value = ((code - under) / minimum) as u8;
                let under = code - (code - under) % minimum;
                let symbol = self.create(value, update);
                self.arena[node as usize].left = symbol;
                return Some((symbol, value, under, minimum));
            }
            self.arena[node as usize].under += u16::from(update);
            self.arena[node as usize].count += update;
            return Some((node, node_value, after - before, before));
        }
    }

    /// Halves every count in the subtree rooted at `symbol`, recomputing
    /// `under` values; returns the subtree's new total.
    fn rescale_tree(&mut self, mut symbol: u16) -> u16 {
        let mut total = 0;
        loop {
            let s = symbol as usize;
            self.arena[s].count -= self.arena[s].count >> 1;
            self.arena[s].under = u16::from(self.arena[s].count);
            let left = self.arena[s].left;
            if left != 0 {
                let left_total = self.rescale_tree(left);
                self.arena[s].under += left_total;
            }
            total += self.arena[s].under;
            let right = self.arena[s].right;
            if right == 0 {
                return total;
            }
            symbol = right;
        }
    }

    fn rescale_context(&mut self, context: u16, minimum: u16) {
        let tree = self.arena[context as usize].symbols;
        let mut total = if tree == 0 { 0 } else { self.rescale_tree(tree) };
        let escapes = self.arena[context as usize].escapes;
        let escapes = escapes - (escapes >> 1);
        self.arena[context as usize].escapes = escapes;
        total += escapes + 256 * minimum;
        self.arena[context as usize].total = total;
    }

    /// Discard and rebuild the model once the arena cannot be guaranteed to
    /// fit the next byte's worth of symbols. Mirrored exactly by the
    /// decoder, which allocates the same number of symbols per byte.
    fn recycle_if_full(&mut self, predicted: &mut u16, order: &mut usize) {
        if self.next >= ARENA - SUBCONTEXT_ORDER {
            self.create_root();
            *predicted = ROOT;
            *order = 0;
        }
    }
}

struct RangeEncoder<'a> {
    output: &'a mut [u8],
    position: usize,
    low: u32,
    range: u32,
}

impl<'a> RangeEncoder<'a> {
    fn new(output: &'a mut [u8]) -> Self {
        Self {
            output,
            position: 0,
            low: 0,
            range: !0,
        }
    }

    fn emit(&mut self, byte: u8) -> bool {
        if self.position >= self.output.len() {
            return false;
        }
        self.output[self.position] = byte;
        self.position += 1;
        true
    }

    fn encode(&mut self, under: u32, count: u32, total: u32) -> bool {
        self.range /= total;
        self.low = self.low.wrapping_add(under * self.range);
        self.range *= count;
        loop {
            if (self.low ^ self.low.wrapping_add(self.range)) >= RANGE_TOP {
                if self.range >= RANGE_BOTTOM {
                    return true;
                }
                self.range = self.low.wrapping_neg() & (RANGE_BOTTOM - 1);
            }
            if !self.emit((self.low >> 24) as u8) {
                return false;
            }
            self.range <<= 8;
            self.low <<= 8;
        }
    }

    fn flush(&mut self) -> bool {
        while self.low != 0 {
            if !self.emit((self.low >> 24) as u8) {
                return false;
            }
            self.low <<= 8;
        }
        true
    }
}

struct RangeDecoder<'a> {
    input: &'a [u8],
    position: usize,
    low: u32,
    code: u32,
    range: u32,
}

impl<'a> RangeDecoder<'a> {
    fn new(input: &'a [u8]) -> Self {
        let mut decoder = Self {
            input,
            position: 0,
            low: 0,
            code: 0,
            range: !0,
        };
        for _ in 0..4 {
            decoder.code = (decoder.code << 8) | u32::from(decoder.next_byte());
        }
        decoder
    }

    fn next_byte(&mut self) -> u8 {
        let byte = self.input.get(self.position).copied().unwrap_or(0);
        self.position += usize::from(self.position < self.input.len());
        byte
    }

    /// Narrows the range to `total` slots and returns the slot under the
    /// current code point.
    fn read(&mut self, total: u32) -> u32 {
        self.range /= total;
        self.code.wrapping_sub(self.low) / self.range
    }

    /// Consumes the interval `[under, under + count)` chosen by the last
    /// [`Self::read`].
    fn consume(&mut self, under: u32, count: u32) {
        self.low = self.low.wrapping_add(under * self.range);
        self.range *= count;
        loop {
            if (self.low ^ self.low.wrapping_add(self.range)) >= RANGE_TOP {
                if self.range >= RANGE_BOTTOM {
                    return;
                }
                self.range = self.low.wrapping_neg() & (RANGE_BOTTOM - 1);
            }
            self.code = (self.code << 8) | u32::from(self.next_byte());
            self.range <<= 8;
            self.low <<= 8;
        }
    }
}

impl Compressor for RangeCoder {
    fn compress(&mut self, input: &[&[u8]], in_limit: usize, output: &mut [u8]) -> usize {
        if input.is_empty() || in_limit == 0 {
            return 0;
        }

        self.create_root();
        let mut predicted = ROOT;
        let mut order = 0usize;
        let mut encoder = RangeEncoder::new(output);

        let bytes = input.iter().flat_map(|buffer| buffer.iter().copied());
        for value in bytes.take(in_limit) {
            let mut link = Link::Predicted;
            let mut context = predicted;
            let mut found = false;

            // Try contexts from longest history to shortest; escape out of
            // each context that has not seen this byte yet.
            while context != ROOT {
                let (symbol, under, count) =
                    self.tree_update(context, value, SUBCONTEXT_SYMBOL_DELTA as u8, 0);
                self.set_link(link, symbol, &mut predicted);
                link = Link::Parent(symbol);

                let escapes = self.arena[context as usize].escapes;
                let total = self.arena[context as usize].total;
                if count > 0 {
                    if !encoder.encode(
                        u32::from(escapes + under),
                        u32::from(count),
                        u32::from(total),
                    ) {
                        return 0;
                    }
                } else {
                    if escapes > 0
                        && escapes < total
                        && !encoder.encode(0, u32::from(escapes), u32::from(total))
                    {
                        return 0;
                    }
                    self.arena[context as usize].escapes += SUBCONTEXT_ESCAPE_DELTA;
                    self.arena[context as usize].total += SUBCONTEXT_ESCAPE_DELTA;
                }
                self.arena[context as usize].total += SUBCONTEXT_SYMBOL_DELTA;
                if count > 0xFF - 2 * SUBCONTEXT_SYMBOL_DELTA
                    || self.arena[context as usize].total > TOTAL_CAP
                {
                    self.rescale_context(context, 0);
                }
                if count > 0 {
                    found = true;
                    break;
                }
                context = self.arena[context as usize].parent;
            }

            if !found {
                let (symbol, under, count) = self.tree_update(
                    ROOT,
                    value,
                    CONTEXT_SYMBOL_DELTA as u8,
                    CONTEXT_SYMBOL_MINIMUM,
                );
                self.set_link(link, symbol, &mut predicted);

                let escapes = self.arena[ROOT as usize].escapes;
                let total = self.arena[ROOT as usize].total;
                if !encoder.encode(
                    u32::from(escapes + under),
                    u32::from(count),
                    u32::from(total),
                ) {
                    return 0;
                }
                self.arena[ROOT as usize].total += CONTEXT_SYMBOL_DELTA;
                if count > 0xFF - 2 * CONTEXT_SYMBOL_DELTA + CONTEXT_SYMBOL_MINIMUM
                    || self.arena[ROOT as usize].total > TOTAL_CAP
                {
                    self.rescale_context(ROOT, CONTEXT_SYMBOL_MINIMUM);
                }
            }

            if order >= SUBCONTEXT_ORDER {
                predicted = self.arena[predicted as usize].parent;
            } else {
                order += 1;
            }
            self.recycle_if_full(&mut predicted, &mut order);
        }

        // The root's escape region is reachable by no byte value, so it
        // doubles as the end-of-stream mark.
        let escapes = self.arena[ROOT as usize].escapes;
        let total = self.arena[ROOT as usize].total;
        if !encoder.encode(0, u32::from(escapes), u32::from(total)) {
            return 0;
        }
        if !encoder.flush() {
            return 0;
        }
        encoder.position
    }

    fn decompress(&mut self, input: &[u8], output: &mut [u8]) -> usize {
        if input.is_empty() {
            return 0;
        }

        self.create_root();
        let mut predicted = ROOT;
        let mut order = 0usize;
        let mut decoder = RangeDecoder::new(input);
        let mut written = 0usize;

        loop {
            let mut context = predicted;
            let mut found: Option<(u16, u8)> = None;

            while context != ROOT {
                let escapes = self.arena[context as usize].escapes;
                let total = self.arena[context as usize].total;
                if escapes > 0 && escapes < total {
                    let code = decoder.read(u32::from(total));
                    if code < u32::from(escapes) {
                        decoder.consume(0, u32::from(escapes));
                    } else {
                        if code >= u32::from(total) {
                            return 0;
                        }
                        let code = (code as u16) - escapes;
                        let Some((symbol, value, under, count)) =
                            self.tree_decode(context, code, SUBCONTEXT_SYMBOL_DELTA as u8, 0)
                        else {
                            return 0;
                        };
                        decoder.consume(u32::from(escapes + under), u32::from(count));
                        self.arena[context as usize].total += SUBCONTEXT_SYMBOL_DELTA;
                        if count > 0xFF - 2 * SUBCONTEXT_SYMBOL_DELTA
                            || self.arena[context as usize].total > TOTAL_CAP
                        {
                            self.rescale_context(context, 0);
                        }
                        found = Some((symbol, value));
                        break;
                    }
                }
                context = self.arena[context as usize].parent;
            }

            let (bottom, value) = if let Some(found) = found {
                found
            } else {
                let escapes = self.arena[ROOT as usize].escapes;
                let total = self.arena[ROOT as usize].total;
                let code = decoder.read(u32::from(total));
                if code < u32::from(escapes) {
                    // end-of-stream mark
                    decoder.consume(0, u32::from(escapes));
                    return written;
                }
                if code >= u32::from(total) {
                    return 0;
                }
                let code = (code as u16) - escapes;
                let Some((symbol, value, under, count)) = self.tree_decode(
                    ROOT,
                    code,
                    CONTEXT_SYMBOL_DELTA as u8,
                    CONTEXT_SYMBOL_MINIMUM,
                ) else {
                    return 0;
                };
                decoder.consume(u32::from(escapes + under), u32::from(count));
                self.arena[ROOT as usize].total += CONTEXT_SYMBOL_DELTA;
                if count > 0xFF - 2 * CONTEXT_SYMBOL_DELTA + CONTEXT_SYMBOL_MINIMUM
                    || self.arena[ROOT as usize].total > TOTAL_CAP
                {
                    self.rescale_context(ROOT, CONTEXT_SYMBOL_MINIMUM);
                }
                (symbol, value)
            };

            // Contexts deeper than the one that produced the byte only saw
            // an escape (or nothing); give them the same count, escape and
            // link updates the encoder applied.
            let stop = match found {
                Some(_) => context,
                None => ROOT,
            };
            let mut link = Link::Predicted;
            let mut patch = predicted;
            while patch != stop {
                let (symbol, _, count) =
                    self.tree_update(patch, value, SUBCONTEXT_SYMBOL_DELTA as u8, 0);
                self.set_link(link, symbol, &mut predicted);
                link = Link::Parent(symbol);

                if count == 0 {
                    self.arena[patch as usize].escapes += SUBCONTEXT_ESCAPE_DELTA;
                    self.arena[patch as usize].total += SUBCONTEXT_ESCAPE_DELTA;
                }
                self.arena[patch as usize].total += SUBCONTEXT_SYMBOL_DELTA;
                if count > 0xFF - 2 * SUBCONTEXT_SYMBOL_DELTA
                    || self.arena[patch as usize].total > TOTAL_CAP
                {
                    self.rescale_context(patch, 0);
                }
                patch = self.arena[patch as usize].parent;
            }
            self.set_link(link, bottom, &mut predicted);

            if written >= output.len() {
                return 0;
            }
            output[written] = value;
            written += 1;

            if order >= SUBCONTEXT_ORDER {
                predicted = self.arena[predicted as usize].parent;
            } else {
                order += 1;
            }
            self.recycle_if_full(&mut predicted, &mut order);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(data: &[u8]) {
        let mut coder = RangeCoder::new();
        let mut compressed = vec![0u8; data.len() * 2 + 64];
        let size = coder.compress(&[data], data.len(), &mut compressed);
        assert!(size > 0, "compress failed for len {}", data.len());

        let mut decompressed = vec![0u8; data.len()];
        let out = coder.decompress(&compressed[..size], &mut decompressed);
        assert_eq!(data.len(), out);
        assert_eq!(data, &decompressed[..]);
    }

    #[test]
    fn round_trip_short() {
        round_trip(b"a");
        round_trip(b"ab");
        round_trip(b"hello, world");
    }

    #[test]
    fn round_trip_repetitive_shrinks() {
        let data = b"the quick brown fox jumps over the lazy dog ".repeat(40);
        let mut coder = RangeCoder::new();
        let mut compressed = vec![0u8; data.len()];
        let size = coder.compress(&[&data], data.len(), &mut compressed);
        assert!(size > 0);
        assert!(size < data.len(), "{size} >= {}", data.len());

        let mut decompressed = vec![0u8; data.len()];
        let out = coder.decompress(&compressed[..size], &mut decompressed);
        assert_eq!(data.len(), out);
        assert_eq!(data, decompressed);
    }

    #[test]
    fn round_trip_all_byte_values() {
        let data: Vec<u8> = (0..=255u8).cycle().take(2048).collect();
        round_trip(&data);
    }

    #[test]
    fn round_trip_long_enough_to_recycle() {
        // enough distinct contexts to exhaust the symbol arena several
        // times over
        let data: Vec<u8> = (0..40_000u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
            .collect();
        round_trip(&data);
    }

    #[test]
    fn gather_matches_contiguous() {
        let data = b"split me into pieces, any pieces".to_vec();
        let mut coder = RangeCoder::new();
        let mut whole = vec![0u8; 256];
        let whole_size = coder.compress(&[&data], data.len(), &mut whole);

        let mut split = vec![0u8; 256];
        let split_size = coder.compress(&[&data[..7], &data[7..20], &data[20..]], data.len(), &mut split);

        assert_eq!(whole_size, split_size);
        assert_eq!(whole[..whole_size], split[..split_size]);
    }

    #[test]
    fn incompressible_output_limit() {
        // output buffer much smaller than what the stream needs
        let data: Vec<u8> = (0..1024u32)
            .map(|i| (i.wrapping_mul(0x9E37_79B9) >> 11) as u8)
            .collect();
        let mut coder = RangeCoder::new();
        let mut out = vec![0u8; 16];
        assert_eq!(0, coder.compress(&[&data], data.len(), &mut out));
    }

    #[test]
    fn empty_input() {
        let mut coder = RangeCoder::new();
        let mut out = vec![0u8; 16];
        assert_eq!(0, coder.compress(&[], 0, &mut out));
        assert_eq!(0, coder.compress(&[b"data"], 0, &mut out));
        assert_eq!(0, coder.decompress(&[], &mut out));
    }
}
