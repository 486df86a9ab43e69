use anyhow::{bail, Result};

use crate::image::Image;

#[derive(Debug)]
pub struct Pyramid {
    pub levels: Vec<Image>,
    pub parent_size: [usize; 2],
}

impl Pyramid {
    pub fn empty() -> Self {
        Self {
            levels: vec![],
            parent_size: [0; 2],
        }
    }

    pub fn compute(&mut self, frame: &Image, level_count: usize) -> Result<()> {
        self.compute_levels(frame, level_count)?;
        self.parent_size = [frame.width, frame.height];
        Ok(())
    }

    fn compute_levels(&mut self, frame: &Image, level_count: usize) -> Result<()> {
        self.levels.truncate(level_count);
        while self.levels.len() < level_count {
            self.levels.push(Image::empty())
        }
        if level_count == 0 {
            return Ok(());
        }
        downscale(frame, &mut self.levels[0])?;
        for i in 0..(level_count - 1) {
            let rest = &mut self.levels[i..];
            // split_first_mut Returns the first and all the rest of the elements of the slice, or None if it is empty
            if let Some((parent, rest)) = rest.split_first_mut() {
                downscale(parent, &mut rest[0])?;
            }
        }
        Ok(())
    }
}

/// downscale the parent image by two and store the result in child.
/// Odd sizes round up; the missing row/column replicates the border.
fn downscale(parent: &Image, child: &mut Image) -> Result<()> {
    let w = parent.width as i32;
    let h = parent.height as i32;
    if w < 2 || h < 2 {
        bail!("cannot downscale image with shape {w} x {h}");
    }

    let w_half = (w + 1) / 2;
    let h_half = (h + 1) / 2;
    child.data.clear();
    child.width = w_half as usize;
    child.height = h_half as usize;

    // prevent pixel out of bounds
    let v = |x: i32, y: i32| -> u16 { parent.value_clamped(x, y) as u16 };

    for y in 0..h_half {
        let y2 = 2 * y;
        for x in 0..w_half {
            let x2 = 2 * x;
            // 3x3 binomial kernel
            let value = v(x2, y2) / 4
                + (v(x2 + 1, y2) + v(x2 - 1, y2) + v(x2, y2 + 1) + v(x2, y2 - 1)) / 8
                + (v(x2 + 1, y2 + 1) + v(x2 - 1, y2 - 1) + v(x2 - 1, y2 + 1) + v(x2 + 1, y2 - 1)) / 16;
            child.data.push(value as u8);
        }
    }
    Ok(())
}
