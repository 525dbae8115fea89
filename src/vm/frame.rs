use super::value::RefValue;

/// Register storage for one active invocation: two parallel arenas indexed
/// by small integers. The integer arena is plain data; the ref arena owns
/// its occupants for the frame's lifetime, releasing the previous occupant
/// whenever a slot is overwritten.
///
/// 64-bit values occupy two contiguous i32 registers (low word first).
/// Floating-point values travel as their exact bit patterns in i32
/// registers, so a bitcast is representation-free.
#[derive(Debug)]
pub struct CallFrame {
    i32_regs: Vec<i32>,
    ref_regs: Vec<Option<RefValue>>,
}

impl CallFrame {
    pub fn new(i32_count: u16, ref_count: u16) -> Self {
        Self {
            i32_regs: vec![0; i32_count as usize],
            ref_regs: (0..ref_count).map(|_| None).collect(),
        }
    }

    #[inline]
    pub fn i32(&self, reg: u16) -> i32 {
        self.i32_regs[reg as usize]
    }

    #[inline]
    pub fn set_i32(&mut self, reg: u16, value: i32) {
        self.i32_regs[reg as usize] = value;
    }

    #[inline]
    pub fn i64(&self, reg: u16) -> i64 {
        let lo = self.i32_regs[reg as usize] as u32 as u64;
        let hi = self.i32_regs[reg as usize + 1] as u32 as u64;
        (hi << 32 | lo) as i64
    }

    #[inline]
    pub fn set_i64(&mut self, reg: u16, value: i64) {
        self.i32_regs[reg as usize] = value as u32 as i32;
        self.i32_regs[reg as usize + 1] = (value as u64 >> 32) as u32 as i32;
    }

    #[inline]
    pub fn f32(&self, reg: u16) -> f32 {
        f32::from_bits(self.i32_regs[reg as usize] as u32)
    }

    #[inline]
    pub fn set_f32(&mut self, reg: u16, value: f32) {
        self.i32_regs[reg as usize] = value.to_bits() as i32;
    }

    #[inline]
    pub fn ref_reg(&self, reg: u16) -> Option<&RefValue> {
        self.ref_regs[reg as usize].as_ref()
    }

    /// Retains the occupant: the register keeps its handle and the caller
    /// gets another.
    #[inline]
    pub fn clone_ref(&self, reg: u16) -> Option<RefValue> {
        self.ref_regs[reg as usize].clone()
    }

    /// Moves the occupant out, leaving the register null.
    #[inline]
    pub fn take_ref(&mut self, reg: u16) -> Option<RefValue> {
        self.ref_regs[reg as usize].take()
    }

    /// Drops any previous occupant, then installs `value`.
    #[inline]
    pub fn set_ref(&mut self, reg: u16, value: Option<RefValue>) {
        self.ref_regs[reg as usize] = value;
    }

    /// Number of non-null ref registers; used to check balance in tests.
    pub fn live_refs(&self) -> usize {
        self.ref_regs.iter().filter(|slot| slot.is_some()).count()
    }
}
