// This module implements the two-pass assembler that turns a flat list of low-level
// instructions into the final bytecode image. Pass one decides the size of every
// instruction (shrinking no-op moves, zero stack adjustments and identity immediates to
// zero bytes when optimisation is enabled) and assigns running byte positions to all of
// them, pseudo instructions included, so labels and code-segment constants acquire their
// final offsets. Pass two encodes every instruction through the shared opcode table,
// resolving frame-relative stack displacements against the final frame sizes, label and
// constant addresses against the positions from pass one, and relative jumps and calls as
// `target - (position + size)`. Each instruction's byte count is compared with the size it
// promised in pass one; any mismatch is an internal compiler error. The comment and debug
// location markers are returned with their final positions for the side-file writer.

//! Two-pass bytecode assembler.

use super::instr::{Imm, Instr, LabelId, StackAmount};
use super::opcode::{Opcode, Operand};
use crate::core::{CompileResult, ConstId, FrameId, Position, StackBase, StackSlot};
use crate::internal;
use hashbrown::HashMap;

/// Final frame sizes and static segment size, fixed once lowering ends.
#[derive(Debug, Clone, Default)]
pub struct FrameLayout {
    pub frame_sizes: Vec<u32>,
    pub static_size: u64,
}

impl FrameLayout {
    pub fn frame_size(&self, frame: FrameId) -> CompileResult<u32> {
        self.frame_sizes
            .get(frame.0 as usize)
            .copied()
            .ok_or_else(|| internal!("unknown frame {}", frame.0))
    }

    fn displacement(&self, slot: &StackSlot) -> CompileResult<i64> {
        let frame_size = match slot.base {
            StackBase::Frame(frame) => self.frame_size(frame)?,
            StackBase::Outgoing => 0,
        };
        Ok(slot.displacement(frame_size))
    }
}

/// A zero-size marker with its final byte position.
#[derive(Debug, Clone, PartialEq)]
pub struct Marker<'s> {
    pub offset: usize,
    pub kind: MarkerKind<'s>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MarkerKind<'s> {
    Comment(&'s str),
    Location {
        name: &'s str,
        position: Position,
        /// Size of the enclosing frame, to turn a forward offset into a displacement.
        frame_size: Option<u32>,
    },
}

/// Output of a successful assembly.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledImage<'s> {
    pub code: Vec<u8>,
    pub markers: Vec<Marker<'s>>,
    labels: HashMap<LabelId, usize>,
    constants: HashMap<ConstId, usize>,
}

impl<'s> AssembledImage<'s> {
    pub fn label_offset(&self, label: LabelId) -> Option<usize> {
        self.labels.get(&label).copied()
    }

    pub fn constant_offset(&self, id: ConstId) -> Option<usize> {
        self.constants.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }
}

/// Byte position and size of one instruction after pass one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub position: usize,
    pub size: usize,
}

/// An instruction with its pass-one position and size.
#[derive(Debug)]
struct Placed<'s> {
    instr: Instr<'s>,
    position: usize,
    size: usize,
}

fn with_blobs<'s>(instrs: &[Instr<'s>], blobs: &[(ConstId, &'s [u8])]) -> Vec<Instr<'s>> {
    let mut program = Vec::with_capacity(instrs.len() + blobs.len());
    program.extend_from_slice(instrs);
    program.extend(blobs.iter().map(|&(id, bytes)| Instr::Data { id, bytes }));
    program
}

/// Operand value as written to the stream.
#[derive(Debug, Clone, Copy)]
enum Encoded {
    Reg(u8),
    Byte(u8),
    Imm(u64),
}

pub struct Assembler<'a> {
    layout: &'a FrameLayout,
    optimize: bool,
}

impl<'a> Assembler<'a> {
    pub fn new(layout: &'a FrameLayout, optimize: bool) -> Self {
        Self { layout, optimize }
    }

    /// Assemble `instrs` followed by the code-segment `blobs`.
    pub fn assemble<'s>(
        &self,
        instrs: &[Instr<'s>],
        blobs: &[(ConstId, &'s [u8])],
    ) -> CompileResult<AssembledImage<'s>> {
        let (placed, labels, constants) = self.layout_pass(with_blobs(instrs, blobs))?;
        let total = placed.last().map_or(0, |p| p.position + p.size);

        let mut image = AssembledImage {
            code: Vec::with_capacity(total),
            markers: Vec::new(),
            labels,
            constants,
        };
        for item in &placed {
            self.emit(item, &mut image)?;
        }

        log::debug!(
            "assembled {} instructions into {} bytes",
            placed.len(),
            image.code.len()
        );
        Ok(image)
    }

    /// Run pass one alone and report where every instruction and blob lands.
    pub fn layout<'s>(
        &self,
        instrs: &[Instr<'s>],
        blobs: &[(ConstId, &'s [u8])],
    ) -> CompileResult<Vec<Extent>> {
        let (placed, _, _) = self.layout_pass(with_blobs(instrs, blobs))?;
        Ok(placed
            .iter()
            .map(|p| Extent {
                position: p.position,
                size: p.size,
            })
            .collect())
    }

    /// Whether `instr` shrinks to zero bytes. Stack adjustments are resolved
    /// against the final frame sizes first.
    pub fn elides(&self, instr: &Instr<'_>) -> CompileResult<bool> {
        if !self.optimize {
            return Ok(false);
        }
        Ok(match instr {
            Instr::StackAdjust(amount) => self.stack_amount(amount)? == 0,
            _ => instr.is_noop(),
        })
    }

    /// Pass one: sizes and positions.
    #[allow(clippy::type_complexity)]
    fn layout_pass<'s>(
        &self,
        program: Vec<Instr<'s>>,
    ) -> CompileResult<(
        Vec<Placed<'s>>,
        HashMap<LabelId, usize>,
        HashMap<ConstId, usize>,
    )> {
        let mut labels = HashMap::new();
        let mut constants = HashMap::new();
        let mut position = 0usize;
        let mut placed = Vec::with_capacity(program.len());

        for instr in program {
            let size = if self.elides(&instr)? {
                0
            } else {
                instr.nominal_size()
            };
            match &instr {
                Instr::Label(label) => {
                    if labels.insert(*label, position).is_some() {
                        return Err(internal!("label {label} placed twice"));
                    }
                }
                Instr::Data { id, .. } => {
                    constants.insert(*id, position);
                }
                _ => {}
            }
            placed.push(Placed {
                instr,
                position,
                size,
            });
            position += size;
        }
        Ok((placed, labels, constants))
    }

    /// Pass two: encode one instruction and check its size.
    fn emit<'s>(&self, item: &Placed<'s>, image: &mut AssembledImage<'s>) -> CompileResult<()> {
        let start = image.code.len();
        if start != item.position {
            return Err(internal!(
                "`{}` emitted at {start}, laid out at {}",
                item.instr,
                item.position
            ));
        }

        match &item.instr {
            Instr::Label(_) => {}
            Instr::Comment(text) => image.markers.push(Marker {
                offset: start,
                kind: MarkerKind::Comment(*text),
            }),
            Instr::DebugLocation {
                name,
                position,
                frame,
            } => {
                let frame_size = frame.map(|f| self.layout.frame_size(f)).transpose()?;
                image.markers.push(Marker {
                    offset: start,
                    kind: MarkerKind::Location {
                        name: *name,
                        position: *position,
                        frame_size,
                    },
                });
            }
            Instr::Data { bytes, .. } => image.code.extend_from_slice(bytes),
            instr if item.size == 0 => {
                log::trace!("elided `{instr}` at {start}");
            }
            instr => {
                let opcode = instr
                    .opcode()
                    .ok_or_else(|| internal!("`{instr}` has no opcode"))?;
                let operands = self.operands(instr, item, image)?;
                write_instruction(&mut image.code, opcode, &operands)?;
            }
        }

        let written = image.code.len() - start;
        if written != item.size {
            return Err(internal!(
                "`{}` wrote {written} bytes, promised {}",
                item.instr,
                item.size
            ));
        }
        Ok(())
    }

    fn resolve_imm(&self, imm: &Imm, image: &AssembledImage<'_>) -> CompileResult<u64> {
        match imm {
            Imm::Value(v) => Ok(*v),
            Imm::ConstantAddress(id) => image
                .constant_offset(*id)
                .map(|p| p as u64)
                .ok_or_else(|| internal!("code constant {} was never laid out", id.0)),
            Imm::LabelAddress(label) => image
                .label_offset(*label)
                .map(|p| p as u64)
                .ok_or_else(|| internal!("label {label} was never placed")),
        }
    }

    fn relative(&self, target: LabelId, item: &Placed<'_>, image: &AssembledImage<'_>) -> CompileResult<u64> {
        let target = image
            .label_offset(target)
            .ok_or_else(|| internal!("jump to unplaced label {target}"))?;
        let next = item.position + item.size;
        Ok((target as i64 - next as i64) as u64)
    }

    fn stack_amount(&self, amount: &StackAmount) -> CompileResult<i64> {
        Ok(match amount {
            StackAmount::FrameEnter(frame) => self.layout.frame_size(*frame)? as i64 - 8,
            StackAmount::FrameLeave(frame) => 8 - self.layout.frame_size(*frame)? as i64,
            StackAmount::StaticSegment => self.layout.static_size as i64,
        })
    }

    fn operands(
        &self,
        instr: &Instr<'_>,
        item: &Placed<'_>,
        image: &AssembledImage<'_>,
    ) -> CompileResult<Vec<Encoded>> {
        use Encoded::{Byte, Imm as I, Reg};
        let disp = |slot: &StackSlot| -> CompileResult<Encoded> {
            Ok(I(self.layout.displacement(slot)? as u64))
        };
        Ok(match instr {
            Instr::Halt | Instr::Ret => vec![],
            Instr::MovImm { dst, imm } | Instr::AluImm { dst, imm, .. } => {
                vec![Reg(dst.id), I(self.resolve_imm(imm, image)?)]
            }
            Instr::Mov { dst, src }
            | Instr::Alu { dst, src, .. }
            | Instr::FAlu { dst, src, .. } => vec![Reg(dst.id), Reg(src.id)],
            Instr::Cmp { lhs, rhs, cond } => vec![Reg(lhs.id), Reg(rhs.id), Byte(*cond as u8)],
            Instr::CmpImm { lhs, imm, cond } => vec![Reg(lhs.id), I(*imm), Byte(*cond as u8)],
            Instr::Neg(reg)
            | Instr::Not(reg)
            | Instr::FNeg(reg)
            | Instr::FNarrow(reg)
            | Instr::Push(reg) => {
                vec![Reg(reg.id)]
            }
            Instr::CallPtr(reg) | Instr::CallExternal { dst: reg } => vec![Reg(reg.id)],
            Instr::Mask { reg, size } | Instr::SignExtend { reg, size } => {
                vec![Reg(reg.id), Byte(*size)]
            }
            Instr::FCmp {
                dst,
                lhs,
                rhs,
                cond,
            } => vec![Reg(dst.id), Reg(lhs.id), Reg(rhs.id), Byte(*cond as u8)],
            Instr::IntToFloat { dst, src, signed } | Instr::FloatToInt { dst, src, signed } => {
                vec![Reg(dst.id), Reg(src.id), Byte(*signed as u8)]
            }
            Instr::LoadStack { dst, slot, size } => {
                if dst.is_float() {
                    vec![Reg(dst.id), disp(slot)?, Byte(*size)]
                } else {
                    vec![Reg(dst.id), disp(slot)?]
                }
            }
            Instr::StoreStack { src, slot, size } => vec![Reg(src.id), disp(slot)?, Byte(*size)],
            Instr::LoadPtr { dst, ptr, size } => {
                if dst.is_float() {
                    vec![Reg(dst.id), Reg(ptr.id), Byte(*size)]
                } else {
                    vec![Reg(dst.id), Reg(ptr.id)]
                }
            }
            Instr::StorePtr { ptr, src, size } => vec![Reg(ptr.id), Reg(src.id), Byte(*size)],
            Instr::LeaStack { dst, slot } => vec![Reg(dst.id), disp(slot)?],
            Instr::CopyStack { dst, src, size } => vec![disp(dst)?, disp(src)?, I(*size)],
            Instr::CopyMem { dst, src, size } => vec![Reg(dst.id), Reg(src.id), I(*size)],
            Instr::RuntimeParam { dst, param } => vec![Reg(dst.id), Byte(*param as u8)],
            Instr::StackAdjust(amount) => vec![I(self.stack_amount(amount)? as u64)],
            Instr::PushImm(v) => vec![I(*v)],
            Instr::Jump(target) | Instr::Call(target) => vec![I(self.relative(*target, item, image)?)],
            Instr::JumpIf { reg, target, .. } => {
                vec![Reg(reg.id), I(self.relative(*target, item, image)?)]
            }
            Instr::Label(_) | Instr::Comment(_) | Instr::DebugLocation { .. } | Instr::Data { .. } => {
                return Err(internal!("pseudo instruction `{instr}` has no operands"))
            }
        })
    }
}

/// Write an opcode and operands, checking them against the opcode table.
fn write_instruction(out: &mut Vec<u8>, opcode: Opcode, operands: &[Encoded]) -> CompileResult<()> {
    let layout = opcode.operands();
    if layout.len() != operands.len() {
        return Err(internal!(
            "{opcode} takes {} operands, got {}",
            layout.len(),
            operands.len()
        ));
    }
    out.push(opcode as u8);
    for (kind, value) in layout.iter().zip(operands) {
        match (kind, value) {
            (Operand::R | Operand::F | Operand::X, Encoded::Reg(r)) => out.push(*r),
            (Operand::B, Encoded::Byte(b)) => out.push(*b),
            (Operand::I, Encoded::Imm(v)) => out.extend_from_slice(&v.to_le_bytes()),
            (kind, value) => {
                return Err(internal!("{opcode}: operand {value:?} does not match {kind:?}"))
            }
        }
    }
    Ok(())
}
