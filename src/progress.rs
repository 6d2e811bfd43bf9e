// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use std::io::Write;

/// Prints a dot on stdout every `every` units of work
pub struct Progress {
    every: usize,
    dots: usize,
}

impl Progress {
    pub fn new(every: usize) -> Self {
        Progress { every: every.max(1), dots: 0 }
    }

    pub fn tick(&mut self, count: usize) {
        if count % self.every == 0 {
            print!(".");
            let _ = std::io::stdout().flush();
            self.dots += 1;
        }
    }

    pub fn finish(&self) {
        if self.dots > 0 {
            println!();
        }
    }

    #[cfg(test)]
    pub fn dots(&self) -> usize {
        self.dots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_ticks_on_multiples() {
        let mut progress = Progress::new(100);
        for i in 0..250 {
            progress.tick(i);
        }
        assert_eq!(progress.dots(), 3);
    }
}
