// Copyright (C) 2025 The Weald Authors. This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Typed primitive I/O against the snapshot byte stream: newline-framed
//! numbers, object ids, strings, tagged values, and opaque verb programs.
//! Any failure surfaces as a single [`DbioError`] and aborts the enclosing
//! load; nothing below this layer partially commits.

use std::io::{self, BufRead, BufReader, Read, Write};

use weald_var::{
    Error, Obj, Symbol, Var, VarType, Variant, v_err, v_float, v_int, v_none, v_obj, v_str,
};

use crate::DbVersion;
use crate::objects::{Program, PropVal, VerbDef};

#[derive(Debug, thiserror::Error)]
pub enum DbioError {
    #[error("io error: {0} @ line {1}")]
    Io(io::Error, usize),
    #[error("parse error: {0} @ line {1}")]
    Parse(String, usize),
}

pub struct DbioReader<R: Read> {
    reader: BufReader<R>,
    pub line_num: usize,
    pushback: Option<String>,
}

impl<R: Read> DbioReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            line_num: 1,
            pushback: None,
        }
    }

    /// Return a line to the stream; the next read yields it again. Used by
    /// the header probe, since a prehistoric snapshot's first line is
    /// already the object count.
    pub fn pushback(&mut self, line: String) {
        self.pushback = Some(line);
    }

    fn next_line(&mut self) -> Result<String, DbioError> {
        if let Some(line) = self.pushback.take() {
            return Ok(line);
        }
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .map_err(|e| DbioError::Io(e, self.line_num))?;
        if n == 0 {
            return Err(DbioError::Parse(
                "unexpected end of file".into(),
                self.line_num,
            ));
        }
        self.line_num += 1;
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(line)
    }

    fn parse_err(&self, msg: String) -> DbioError {
        DbioError::Parse(msg, self.line_num)
    }

    pub fn read_string(&mut self) -> Result<String, DbioError> {
        self.next_line()
    }

    pub fn read_string_intern(&mut self) -> Result<Symbol, DbioError> {
        Ok(Symbol::mk(&self.next_line()?))
    }

    pub fn read_num(&mut self) -> Result<i64, DbioError> {
        let buf = self.next_line()?;
        buf.trim()
            .parse()
            .map_err(|_| self.parse_err(format!("invalid number: {buf}")))
    }

    pub fn read_objid(&mut self) -> Result<Obj, DbioError> {
        let buf = self.next_line()?;
        let id = buf
            .trim()
            .parse()
            .map_err(|_| self.parse_err(format!("invalid objid: {buf}")))?;
        Ok(Obj::mk_id(id))
    }

    pub fn read_float(&mut self) -> Result<f64, DbioError> {
        let buf = self.next_line()?;
        buf.trim()
            .parse()
            .map_err(|_| self.parse_err(format!("invalid float: {buf}")))
    }

    /// Read a line which is a series of numbers.
    pub fn read_number_line(&mut self, expected_count: usize) -> Result<Vec<i64>, DbioError> {
        let line = self.next_line()?;
        let mut numbers = Vec::with_capacity(expected_count);
        for n in line.split_whitespace() {
            let n = n
                .parse::<i64>()
                .map_err(|e| DbioError::Parse(format!("invalid number: {e}"), self.line_num))?;
            numbers.push(n);
        }
        if numbers.len() != expected_count {
            return Err(self.parse_err(format!(
                "expected {} numbers, got {}",
                expected_count,
                numbers.len()
            )));
        }
        Ok(numbers)
    }

    pub fn read_var(&mut self) -> Result<Var, DbioError> {
        let t_num = self.read_num()?;
        self.read_var_value(t_num)
    }

    fn read_var_value(&mut self, t_num: i64) -> Result<Var, DbioError> {
        let vtype = u8::try_from(t_num)
            .ok()
            .and_then(VarType::from_repr)
            .ok_or_else(|| self.parse_err(format!("invalid var type code: {t_num}")))?;
        let v = match vtype {
            VarType::TYPE_INT => v_int(self.read_num()?),
            VarType::TYPE_OBJ => v_obj(self.read_objid()?),
            VarType::TYPE_STR => v_str(&self.read_string()?),
            VarType::TYPE_ERR => {
                let e_num = self.read_num()?;
                let code = u8::try_from(e_num)
                    .ok()
                    .and_then(Error::from_repr)
                    .ok_or_else(|| self.parse_err(format!("invalid error code: {e_num}")))?;
                v_err(code)
            }
            VarType::TYPE_LIST => {
                let l_size = self.read_num()?;
                if l_size < 0 {
                    return Err(self.parse_err(format!("negative list length: {l_size}")));
                }
                let mut items = Vec::with_capacity(l_size as usize);
                for _ in 0..l_size {
                    items.push(self.read_var()?);
                }
                Var::from_variant(Variant::List(items.into()))
            }
            VarType::TYPE_CLEAR => {
                return Err(self.parse_err("clear value outside a property slot".into()));
            }
            VarType::TYPE_NONE => v_none(),
            // Stack markers from suspended-task frames; only the label
            // matters for re-framing.
            VarType::TYPE_CATCH | VarType::TYPE_FINALLY => v_int(self.read_num()?),
            VarType::TYPE_FLOAT => v_float(self.read_float()?),
        };
        Ok(v)
    }

    pub fn read_verbdef(&mut self) -> Result<VerbDef, DbioError> {
        let name = self.read_string_intern()?;
        let owner = self.read_objid()?;
        let perms = self.read_num()? as u16;
        let prep = self.read_num()? as i16;
        Ok(VerbDef {
            name,
            owner,
            perms,
            prep,
            program: None,
        })
    }

    pub fn read_propval(&mut self) -> Result<PropVal, DbioError> {
        let t_num = self.read_num()?;
        // A "clear" slot has no value of its own; it resolves through the
        // property's definer at runtime.
        let is_clear = t_num == VarType::TYPE_CLEAR as i64;
        let value = if is_clear {
            v_none()
        } else {
            self.read_var_value(t_num)?
        };
        Ok(PropVal {
            value,
            owner: self.read_objid()?,
            perms: self.read_num()? as u8,
            is_clear,
        })
    }

    /// Read one opaque verb program: its text up to the lone `.` terminator.
    /// `version` is the snapshot's declared format version, recorded on the
    /// program so the VM can decode older code. `verb_name` labels parse
    /// diagnostics.
    pub fn read_program(
        &mut self,
        version: DbVersion,
        verb_name: impl Fn() -> String,
    ) -> Result<Program, DbioError> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_string().map_err(|e| {
                DbioError::Parse(
                    format!("unparsable program for {}: {e}", verb_name()),
                    self.line_num,
                )
            })?;
            if line == "." {
                break;
            }
            lines.push(line);
        }
        Ok(Program {
            language_version: version,
            source: lines.join("\n"),
        })
    }
}

pub struct DbioWriter<W: Write> {
    writer: W,
}

impl<W: Write> DbioWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    pub fn write_line(&mut self, s: &str) -> io::Result<()> {
        writeln!(self.writer, "{s}")
    }

    pub fn write_num(&mut self, n: i64) -> io::Result<()> {
        writeln!(self.writer, "{n}")
    }

    pub fn write_objid(&mut self, o: Obj) -> io::Result<()> {
        writeln!(self.writer, "{}", o.id())
    }

    pub fn write_float(&mut self, f: f64) -> io::Result<()> {
        writeln!(self.writer, "{f:+e}")
    }

    pub fn write_string(&mut self, s: &str) -> io::Result<()> {
        writeln!(self.writer, "{s}")
    }

    pub fn write_var(&mut self, var: &Var) -> io::Result<()> {
        match var.variant() {
            Variant::Int(i) => writeln!(self.writer, "{}\n{}", VarType::TYPE_INT as u8, i),
            Variant::Obj(o) => writeln!(self.writer, "{}\n{}", VarType::TYPE_OBJ as u8, o.id()),
            Variant::Str(s) => writeln!(self.writer, "{}\n{}", VarType::TYPE_STR as u8, s),
            Variant::Err(e) => writeln!(self.writer, "{}\n{}", VarType::TYPE_ERR as u8, *e as u8),
            Variant::List(l) => {
                writeln!(self.writer, "{}\n{}", VarType::TYPE_LIST as u8, l.len())?;
                for v in l.iter() {
                    self.write_var(v)?;
                }
                Ok(())
            }
            Variant::None => writeln!(self.writer, "{}", VarType::TYPE_NONE as u8),
            Variant::Float(f) => writeln!(self.writer, "{}\n{:+e}", VarType::TYPE_FLOAT as u8, f),
        }
    }

    pub fn write_verbdef(&mut self, v: &VerbDef) -> io::Result<()> {
        self.write_string(&v.name.as_arc_str())?;
        self.write_objid(v.owner)?;
        self.write_num(v.perms as i64)?;
        self.write_num(v.prep as i64)
    }

    pub fn write_propval(&mut self, p: &PropVal) -> io::Result<()> {
        if p.is_clear {
            self.write_num(VarType::TYPE_CLEAR as i64)?;
        } else {
            self.write_var(&p.value)?;
        }
        self.write_objid(p.owner)?;
        self.write_num(p.perms as i64)
    }

    pub fn write_program(&mut self, program: &Program) -> io::Result<()> {
        for line in program.source.lines() {
            writeln!(self.writer, "{line}")?;
        }
        writeln!(self.writer, ".")
    }
}
