use std::sync::{Mutex, MutexGuard};

use crate::modbus::protocol::ExceptionCode;

/// Every range access takes the single lock, so a two-register value is
/// never observed half-written.
#[derive(Debug)]
pub struct RegisterStore {
    registers: Mutex<Vec<u16>>,
}

impl RegisterStore {
    pub fn new(size: usize) -> Self {
        Self {
            registers: Mutex::new(vec![0; size]),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read(&self, start: u16, count: u16) -> Result<Vec<u16>, ExceptionCode> {
        let registers = self.lock();
        let range = Self::range(registers.len(), start, count as usize)?;
        Ok(registers[range].to_vec())
    }

    pub fn write(&self, start: u16, values: &[u16]) -> Result<(), ExceptionCode> {
        let mut registers = self.lock();
        let range = Self::range(registers.len(), start, values.len())?;
        registers[range].copy_from_slice(values);
        Ok(())
    }

    fn range(len: usize, start: u16, count: usize) -> Result<std::ops::Range<usize>, ExceptionCode> {
        let start = start as usize;
        let end = start + count;
        if count == 0 || end > len {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        Ok(start..end)
    }

    // Writes are a single copy_from_slice; a poisoned lock never guards a torn value.
    fn lock(&self) -> MutexGuard<'_, Vec<u16>> {
        self.registers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_unwritten_registers_read_zero() {
        let store = RegisterStore::new(100);
        assert_eq!(store.read(10, 2).unwrap(), vec![0, 0]);
    }

    #[test]
    fn test_write_then_read() {
        let store = RegisterStore::new(100);
        store.write(40, &[0x51EC, 0x449A]).unwrap();
        assert_eq!(store.read(40, 2).unwrap(), vec![0x51EC, 0x449A]);
        assert_eq!(store.read(39, 4).unwrap(), vec![0, 0x51EC, 0x449A, 0]);
    }

    #[test]
    fn test_out_of_range_is_illegal_address() {
        let store = RegisterStore::new(10);
        assert_eq!(store.read(9, 2), Err(ExceptionCode::IllegalDataAddress));
        assert_eq!(store.write(10, &[1]), Err(ExceptionCode::IllegalDataAddress));
        assert_eq!(store.read(0, 0), Err(ExceptionCode::IllegalDataAddress));
    }

    #[test]
    fn test_concurrent_pair_writes_are_never_torn() {
        let store = Arc::new(RegisterStore::new(4));
        store.write(0, &[0, !0]).unwrap();

        let writers: Vec<_> = (0..4u16)
            .map(|id| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..2_000u16 {
                        let tag = id.wrapping_mul(10_000).wrapping_add(i);
                        store.write(0, &[tag, !tag]).unwrap();
                    }
                })
            })
            .collect();

        for _ in 0..5_000 {
            let pair = store.read(0, 2).unwrap();
            assert_eq!(pair[1], !pair[0], "torn read: {:?}", pair);
        }

        for writer in writers {
            writer.join().unwrap();
        }
    }
}
