//-
// Copyright (c) 2020, Jason Lingle
//
// This file is part of Mboxidx.
//
// Mboxidx is free software: you can redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Mboxidx is distributed in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Mboxidx. If not, see <http://www.gnu.org/licenses/>.

/// The hierarchy separator of mailbox names.
pub const HIERARCHY_SEPARATOR: char = '.';

/// Determine whether the given hierarchical mailbox name is "safe".
///
/// A mailbox `a.b.c` maps to the directory `a/b/c` under its partition, so
/// every component must be usable as one path element. This excludes empty
/// components (and with them leading, trailing or doubled separators), path
/// separators, control characters and the wildcard characters that have
/// special meaning in mailbox patterns.
pub fn is_safe_mailbox_name(name: &str) -> bool {
    !name.is_empty() && name.split(HIERARCHY_SEPARATOR).all(is_safe_component)
}

fn is_safe_component(component: &str) -> bool {
    !component.is_empty()
        && component.find(|c| c == '/' || c == '\\').is_none()
        && component.find(|c| c < ' ' || c == '\x7F').is_none()
        && component.find(|c| c == '*' || c == '%').is_none()
}

/// Determine whether `name` is a valid user flag (IMAP atom) name.
pub fn is_atom(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(is_atom_char)
}

fn is_atom_char(ch: u8) -> bool {
    match ch {
        0..=b' ' => false,
        127..=255 => false,
        b'(' | b')' | b'{' | b'*' | b'%' | b'\\' | b'"' | b']' => false,
        _ => true,
    }
}
