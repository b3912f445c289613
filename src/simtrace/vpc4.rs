// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! VPC4 value predictors: finite context method (FCM) predictors over
//! plain values and strides (DFCM), a keyed last-N-value predictor and the
//! compound codecs for instruction pointers, data values and cycle counts.
//!
//! A predictor id names one slot of one ensemble member; the reserved
//! highest id means "not predicted, literal follows in the data stream".
//! Ids are emitted half-byte packed. Predictors update their history
//! after prediction, in the same order on the encode and decode paths, so
//! both sides stay in lock step.

use crate::error::{Result, SimutraceError};

/// History hashes are 32 bits wide.
type HashType = u32;

pub type PredictorId = u8;

// ─────────────────────────────── value trait ─────────────────────────────────

/// Field value a predictor operates on (32- or 64-bit).
pub trait VpcValue: Copy + Eq + Default + Send + Sync + 'static {
    const BYTES: usize;

    fn wrapping_sub(self, other: Self) -> Self;
    fn wrapping_add(self, other: Self) -> Self;
    fn to_u64(self) -> u64;
    fn from_u64(value: u64) -> Self;
    fn write_le(self, out: &mut [u8]);
    fn read_le(src: &[u8]) -> Self;

    /// Fold & mask hash using XOR, folding `hash_bits` at a time.
    fn fold_hash(self, hash_bits: u32) -> HashType {
        let mask: u64 = (1u64 << hash_bits) - 1;
        let mut hash: u64 = 0;
        let mut tmp = self.to_u64();
        while tmp > 0 {
            hash ^= tmp;
            tmp >>= hash_bits;
        }
        (hash & mask) as HashType
    }
}

impl VpcValue for u32 {
    const BYTES: usize = 4;

    fn wrapping_sub(self, other: Self) -> Self {
        u32::wrapping_sub(self, other)
    }
    fn wrapping_add(self, other: Self) -> Self {
        u32::wrapping_add(self, other)
    }
    fn to_u64(self) -> u64 {
        self as u64
    }
    fn from_u64(value: u64) -> Self {
        value as u32
    }
    fn write_le(self, out: &mut [u8]) {
        out[..4].copy_from_slice(&self.to_le_bytes());
    }
    fn read_le(src: &[u8]) -> Self {
        u32::from_le_bytes([src[0], src[1], src[2], src[3]])
    }
}

impl VpcValue for u64 {
    const BYTES: usize = 8;

    fn wrapping_sub(self, other: Self) -> Self {
        u64::wrapping_sub(self, other)
    }
    fn wrapping_add(self, other: Self) -> Self {
        u64::wrapping_add(self, other)
    }
    fn to_u64(self) -> u64 {
        self
    }
    fn from_u64(value: u64) -> Self {
        value
    }
    fn write_le(self, out: &mut [u8]) {
        out[..8].copy_from_slice(&self.to_le_bytes());
    }
    fn read_le(src: &[u8]) -> Self {
        u64::from_le_bytes([src[0], src[1], src[2], src[3], src[4], src[5], src[6], src[7]])
    }
}

// ─────────────────────────────── cursors ─────────────────────────────────────

/// Half-byte packed predictor-id writer. The first id of a pair occupies
/// the low nibble.
pub struct IdWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
    low: bool,
}

impl<'a> IdWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        IdWriter { buf, pos: 0, low: true }
    }

    pub fn write(&mut self, id: PredictorId) {
        debug_assert!(id <= 0x0F);
        if self.low {
            self.buf[self.pos] = id;
        } else {
            self.buf[self.pos] |= id << 4;
            self.pos += 1;
        }
        self.low = !self.low;
    }
}

pub struct IdReader<'a> {
    buf: &'a [u8],
    pos: usize,
    low: bool,
}

impl<'a> IdReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        IdReader { buf, pos: 0, low: true }
    }

    pub fn read(&mut self) -> PredictorId {
        let id = if self.low {
            self.buf[self.pos] & 0x0F
        } else {
            let id = self.buf[self.pos] >> 4;
            self.pos += 1;
            id
        };
        self.low = !self.low;
        id
    }
}

/// Little-endian literal cursor for unpredicted values.
pub struct DataWriter<'a, T: VpcValue> {
    buf: &'a mut [u8],
    pos: usize,
    _marker: std::marker::PhantomData<T>,
}

impl<'a, T: VpcValue> DataWriter<'a, T> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        DataWriter { buf, pos: 0, _marker: std::marker::PhantomData }
    }

    pub fn write(&mut self, value: T) {
        value.write_le(&mut self.buf[self.pos..]);
        self.pos += T::BYTES;
    }

    pub fn bytes_used(&self) -> usize {
        self.pos
    }

    /// Fills the rest of the buffer with `fill` to help the second-stage
    /// compressor.
    pub fn fill_remaining(&mut self, fill: u8) {
        for byte in &mut self.buf[self.pos..] {
            *byte = fill;
        }
    }
}

pub struct DataReader<'a, T: VpcValue> {
    buf: &'a [u8],
    pos: usize,
    _marker: std::marker::PhantomData<T>,
}

impl<'a, T: VpcValue> DataReader<'a, T> {
    pub fn new(buf: &'a [u8]) -> Self {
        DataReader { buf, pos: 0, _marker: std::marker::PhantomData }
    }

    pub fn read(&mut self) -> T {
        let value = T::read_le(&self.buf[self.pos..]);
        self.pos += T::BYTES;
        value
    }
}

// ─────────────────────────────── histories ───────────────────────────────────

/// Rolling symbol history shared by FCM predictors. Keyed variants hold one
/// history line per key hash; an unkeyed history is the single-line case.
pub struct KeyedHistory<T: VpcValue> {
    hash_bits: u32,
    order: usize,
    table_mask: usize,
    index: usize,
    table: Vec<HashType>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: VpcValue> KeyedHistory<T> {
    pub fn new(table_bits: u32, hash_bits: u32, order: usize) -> Self {
        let lines = 1usize << table_bits;
        KeyedHistory {
            hash_bits,
            order,
            table_mask: lines - 1,
            index: 0,
            table: vec![0; lines * order],
            _marker: std::marker::PhantomData,
        }
    }

    pub fn set_key(&mut self, key: u64) {
        self.index = (key as usize) & self.table_mask;
    }

    /// History value matching a predictor of the given order.
    pub fn get(&self, order: usize) -> HashType {
        debug_assert!(order >= 1 && order <= self.order);
        self.table[self.index * self.order + (order - 1)]
    }

    pub fn update(&mut self, value: T) {
        let hash = value.fold_hash(self.hash_bits);
        let base = self.index * self.order;
        for i in (1..self.order).rev() {
            self.table[base + i] = (self.table[base + i - 1] << 1) ^ hash;
        }
        self.table[base] = hash;
    }
}

// ─────────────────────────────── prediction ──────────────────────────────────

/// Carried through all ensemble members of one field; the member with the
/// highest hit count that predicted correctly wins, ties going to the
/// lowest id.
#[derive(Default)]
pub struct PredictionContext {
    usage_count: u64,
    predictor_id: Option<PredictorId>,
}

impl PredictionContext {
    pub fn is_predicted(&self) -> bool {
        self.predictor_id.is_some()
    }
}

/// FCM predictor table: per hashed input history, a short list of the most
/// recent values, each slot addressable through its own predictor id.
pub struct Fcm<T: VpcValue> {
    id_base: PredictorId,
    line: usize,
    table_mask: usize,
    values: Vec<T>,
    usage: Vec<u64>,
}

impl<T: VpcValue> Fcm<T> {
    pub fn new(id_base: PredictorId, table_bits: u32, line: usize) -> Self {
        let lines = 1usize << table_bits;
        // Distinct initial values; an all-zero line would predict the same
        // value from multiple slots.
        let mut values = vec![T::default(); lines * line];
        for row in 0..lines {
            for slot in 0..line {
                values[row * line + slot] = T::from_u64(slot as u64);
            }
        }
        Fcm { id_base, line, table_mask: lines - 1, values, usage: vec![0; line] }
    }

    pub fn index(&self, history_value: HashType) -> usize {
        (history_value as usize) & self.table_mask
    }

    fn shift_in(&mut self, index: usize, value: T) {
        let base = index * self.line;
        // Only insert when the first slot differs; the decoder cannot
        // compare against all slots, so a full-line check is off limits.
        if self.values[base] != value {
            for i in (1..self.line).rev() {
                self.values[base + i] = self.values[base + i - 1];
            }
            self.values[base] = value;
        }
    }

    /// Checks all slots against `value` and bids on the context, then
    /// shifts the value into the line.
    pub fn predict(&mut self, context: &mut PredictionContext, index: usize, value: T) {
        for slot in 0..self.line {
            if self.values[index * self.line + slot] == value {
                let usage = self.usage[slot];
                if context.predictor_id.is_none() || usage > context.usage_count {
                    context.predictor_id = Some(self.id_base + slot as PredictorId);
                    context.usage_count = usage;
                }
            }
        }
        self.shift_in(index, value);
    }

    pub fn get(&self, index: usize, id: PredictorId) -> T {
        debug_assert!(id >= self.id_base && ((id - self.id_base) as usize) < self.line);
        self.values[index * self.line + (id - self.id_base) as usize]
    }

    pub fn update(&mut self, index: usize, value: T) {
        self.shift_in(index, value);
    }

    pub fn owns(&self, id: PredictorId) -> bool {
        id >= self.id_base && ((id - self.id_base) as usize) < self.line
    }

    pub fn increment_usage(&mut self, id: PredictorId) {
        self.usage[(id - self.id_base) as usize] += 1;
    }
}

// ─────────────────────────────── ip predictor ────────────────────────────────

/// Instruction pointer ensemble: 1st and 3rd order FCMs over a shared
/// history. Ids 0..3; 4 = literal.
pub struct IpPredictor<T: VpcValue> {
    history: KeyedHistory<T>,
    first: Fcm<T>,
    third: Fcm<T>,
}

impl<T: VpcValue> IpPredictor<T> {
    pub const NOT_PREDICTED: PredictorId = 4;

    pub fn new() -> Self {
        IpPredictor {
            history: KeyedHistory::new(0, 17, 3),
            first: Fcm::new(0, 17, 2),
            third: Fcm::new(2, 19, 2),
        }
    }

    pub fn encode(&mut self, ids: &mut IdWriter<'_>, data: &mut DataWriter<'_, T>, ip: T) {
        let mut context = PredictionContext::default();
        let i1 = self.first.index(self.history.get(1));
        let i3 = self.third.index(self.history.get(3));

        self.first.predict(&mut context, i1, ip);
        self.third.predict(&mut context, i3, ip);
        self.history.update(ip);

        match context.predictor_id {
            Some(id) => {
                if self.first.owns(id) {
                    self.first.increment_usage(id);
                } else {
                    self.third.increment_usage(id);
                }
                ids.write(id);
            }
            None => {
                data.write(ip);
                ids.write(Self::NOT_PREDICTED);
            }
        }
    }

    pub fn decode(&mut self, ids: &mut IdReader<'_>, data: &mut DataReader<'_, T>) -> Result<T> {
        let i1 = self.first.index(self.history.get(1));
        let i3 = self.third.index(self.history.get(3));

        let id = ids.read();
        let ip = if id < 2 {
            self.first.get(i1, id)
        } else if id < 4 {
            self.third.get(i3, id)
        } else if id == Self::NOT_PREDICTED {
            data.read()
        } else {
            return Err(SimutraceError::OutOfBounds(format!("ip predictor id {id}")));
        };

        self.first.update(i1, ip);
        self.third.update(i3, ip);
        self.history.update(ip);
        Ok(ip)
    }
}

// ─────────────────────────────── value predictor ─────────────────────────────

/// Data value ensemble keyed by the instruction pointer: 1st/3rd order
/// DFCMs over strides with a shared history, a private 1st order FCM and a
/// last-4-value predictor. Ids 0..9; 10 = literal.
pub struct ValuePredictor<T: VpcValue> {
    shared_dfcm_history: KeyedHistory<T>,
    dfcm_first: Fcm<T>,
    dfcm_third: Fcm<T>,
    fcm_history: KeyedHistory<T>,
    fcm_first: Fcm<T>,
    last4: Fcm<T>,
    last4_mask: usize,
}

impl<T: VpcValue> ValuePredictor<T> {
    pub const NOT_PREDICTED: PredictorId = 10;

    pub fn new() -> Self {
        ValuePredictor {
            shared_dfcm_history: KeyedHistory::new(16, 17, 3),
            dfcm_first: Fcm::new(0, 17, 2),
            dfcm_third: Fcm::new(2, 19, 2),
            fcm_history: KeyedHistory::new(16, 19, 1),
            fcm_first: Fcm::new(8, 19, 2),
            // The last-value predictor is an FCM indexed directly by the
            // key instead of a history hash.
            last4: Fcm::new(4, 16, 4),
            last4_mask: (1usize << 16) - 1,
        }
    }

    fn set_key(&mut self, key: u64) -> usize {
        self.shared_dfcm_history.set_key(key);
        self.fcm_history.set_key(key);
        (key as usize) & self.last4_mask
    }

    pub fn encode(&mut self, ids: &mut IdWriter<'_>, data: &mut DataWriter<'_, T>, value: T, key: u64) {
        let l4 = self.set_key(key);
        let most_recent = self.last4.get(l4, 4);
        let stride = value.wrapping_sub(most_recent);

        let d1 = self.dfcm_first.index(self.shared_dfcm_history.get(1));
        let d3 = self.dfcm_third.index(self.shared_dfcm_history.get(3));
        let f1 = self.fcm_first.index(self.fcm_history.get(1));

        let mut context = PredictionContext::default();
        self.dfcm_first.predict(&mut context, d1, stride);
        self.dfcm_third.predict(&mut context, d3, stride);
        self.last4.predict(&mut context, l4, value);
        self.fcm_first.predict(&mut context, f1, value);

        self.shared_dfcm_history.update(stride);
        self.fcm_history.update(value);

        match context.predictor_id {
            Some(id) => {
                if self.dfcm_first.owns(id) {
                    self.dfcm_first.increment_usage(id);
                } else if self.dfcm_third.owns(id) {
                    self.dfcm_third.increment_usage(id);
                } else if self.last4.owns(id) {
                    self.last4.increment_usage(id);
                } else {
                    self.fcm_first.increment_usage(id);
                }
                ids.write(id);
            }
            None => {
                data.write(value);
                ids.write(Self::NOT_PREDICTED);
            }
        }
    }

    pub fn decode(
        &mut self,
        ids: &mut IdReader<'_>,
        data: &mut DataReader<'_, T>,
        key: u64,
    ) -> Result<T> {
        let l4 = self.set_key(key);
        let most_recent = self.last4.get(l4, 4);

        let d1 = self.dfcm_first.index(self.shared_dfcm_history.get(1));
        let d3 = self.dfcm_third.index(self.shared_dfcm_history.get(3));
        let f1 = self.fcm_first.index(self.fcm_history.get(1));

        let id = ids.read();
        let value = if id < 2 {
            self.dfcm_first.get(d1, id).wrapping_add(most_recent)
        } else if id < 4 {
            self.dfcm_third.get(d3, id).wrapping_add(most_recent)
        } else if id < 8 {
            self.last4.get(l4, id)
        } else if id < 10 {
            self.fcm_first.get(f1, id)
        } else if id == Self::NOT_PREDICTED {
            data.read()
        } else {
            return Err(SimutraceError::OutOfBounds(format!("value predictor id {id}")));
        };

        let stride = value.wrapping_sub(most_recent);
        self.dfcm_first.update(d1, stride);
        self.dfcm_third.update(d3, stride);
        self.last4.update(l4, value);
        self.fcm_first.update(f1, value);

        self.shared_dfcm_history.update(stride);
        self.fcm_history.update(value);
        Ok(value)
    }
}

// ─────────────────────────────── cycle predictor ─────────────────────────────

/// Cycle count ensemble: FCMs over `stride + ip`, where the stride runs
/// against the previously emitted cycle count. Ids 0..3; 4 = literal
/// stride.
pub struct CyclePredictor {
    history: KeyedHistory<u64>,
    first: Fcm<u64>,
    third: Fcm<u64>,
    reference: u64,
}

impl CyclePredictor {
    pub const NOT_PREDICTED: PredictorId = 4;

    pub fn new(reference_cycle: u64) -> Self {
        CyclePredictor {
            history: KeyedHistory::new(0, 17, 3),
            first: Fcm::new(0, 17, 2),
            third: Fcm::new(2, 19, 2),
            reference: reference_cycle,
        }
    }

    pub fn encode(
        &mut self,
        ids: &mut IdWriter<'_>,
        data: &mut DataWriter<'_, u64>,
        cycle: u64,
        ip: u64,
    ) {
        let stride = cycle.wrapping_sub(self.reference);
        let value = stride.wrapping_add(ip);
        self.reference = cycle;

        let i1 = self.first.index(self.history.get(1));
        let i3 = self.third.index(self.history.get(3));

        let mut context = PredictionContext::default();
        self.first.predict(&mut context, i1, value);
        self.third.predict(&mut context, i3, value);
        self.history.update(value);

        match context.predictor_id {
            Some(id) => {
                if self.first.owns(id) {
                    self.first.increment_usage(id);
                } else {
                    self.third.increment_usage(id);
                }
                ids.write(id);
            }
            None => {
                // The literal carries the stride, not the hashed value.
                data.write(stride);
                ids.write(Self::NOT_PREDICTED);
            }
        }
    }

    pub fn decode(
        &mut self,
        ids: &mut IdReader<'_>,
        data: &mut DataReader<'_, u64>,
        ip: u64,
    ) -> Result<u64> {
        let i1 = self.first.index(self.history.get(1));
        let i3 = self.third.index(self.history.get(3));

        let id = ids.read();
        let (stride, update) = if id < 2 {
            let value = self.first.get(i1, id);
            (value.wrapping_sub(ip), value)
        } else if id < 4 {
            let value = self.third.get(i3, id);
            (value.wrapping_sub(ip), value)
        } else if id == Self::NOT_PREDICTED {
            let stride = data.read();
            (stride, stride.wrapping_add(ip))
        } else {
            return Err(SimutraceError::OutOfBounds(format!("cycle predictor id {id}")));
        };

        self.first.update(i1, update);
        self.third.update(i3, update);
        self.history.update(update);

        self.reference = self.reference.wrapping_add(stride);
        Ok(self.reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_predictor_round_trips_a_repeating_pattern() {
        let mut encoder: IpPredictor<u64> = IpPredictor::new();
        let mut decoder: IpPredictor<u64> = IpPredictor::new();

        let ips: Vec<u64> = (0..4096).map(|i| 0x4000 + (i % 16) as u64).collect();

        let mut id_buf = vec![0u8; 4096];
        let mut data_buf = vec![0u8; 4096 * 8];
        let mut ids = IdWriter::new(&mut id_buf);
        let mut data = DataWriter::new(&mut data_buf);
        for &ip in &ips {
            encoder.encode(&mut ids, &mut data, ip);
        }

        let mut ids = IdReader::new(&id_buf);
        let mut data = DataReader::new(&data_buf);
        for &ip in &ips {
            assert_eq!(decoder.decode(&mut ids, &mut data).expect("decode"), ip);
        }
    }

    #[test]
    fn value_predictor_round_trips_strided_values() {
        let mut encoder: ValuePredictor<u64> = ValuePredictor::new();
        let mut decoder: ValuePredictor<u64> = ValuePredictor::new();

        let values: Vec<(u64, u64)> =
            (0..4096).map(|i| (0x1000 + i as u64 * 8, 0x4000 + (i % 7) as u64)).collect();

        let mut id_buf = vec![0u8; 4096];
        let mut data_buf = vec![0u8; 4096 * 8];
        let mut ids = IdWriter::new(&mut id_buf);
        let mut data = DataWriter::new(&mut data_buf);
        for &(value, key) in &values {
            encoder.encode(&mut ids, &mut data, value, key);
        }

        let mut ids = IdReader::new(&id_buf);
        let mut data = DataReader::new(&data_buf);
        for &(value, key) in &values {
            assert_eq!(decoder.decode(&mut ids, &mut data, key).expect("decode"), value);
        }
    }

    #[test]
    fn cycle_predictor_round_trips_monotonic_cycles() {
        let mut encoder = CyclePredictor::new(100);
        let mut decoder = CyclePredictor::new(100);

        let cycles: Vec<(u64, u64)> =
            (0..4096).map(|i| (100 + i as u64, 0x4000 + (i % 5) as u64)).collect();

        let mut id_buf = vec![0u8; 4096];
        let mut data_buf = vec![0u8; 4096 * 8];
        let mut ids = IdWriter::new(&mut id_buf);
        let mut data = DataWriter::new(&mut data_buf);
        for &(cycle, ip) in &cycles {
            encoder.encode(&mut ids, &mut data, cycle, ip);
        }

        let mut ids = IdReader::new(&id_buf);
        let mut data = DataReader::new(&data_buf);
        for &(cycle, ip) in &cycles {
            assert_eq!(decoder.decode(&mut ids, &mut data, ip).expect("decode"), cycle);
        }
    }

    #[test]
    fn half_byte_ids_pack_two_per_byte() {
        let mut buf = vec![0u8; 2];
        let mut writer = IdWriter::new(&mut buf);
        writer.write(0x3);
        writer.write(0xA);
        writer.write(0x1);
        assert_eq!(buf[0], 0xA3);
        assert_eq!(buf[1], 0x01);

        let mut reader = IdReader::new(&buf);
        assert_eq!(reader.read(), 0x3);
        assert_eq!(reader.read(), 0xA);
        assert_eq!(reader.read(), 0x1);
    }
}
