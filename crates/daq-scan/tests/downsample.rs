//! Downsampler behaviour across arbitrary chunk splits.

use daq_scan::downsample::{Downsampler, ReductionMode};
use ndarray::Array2;

fn reduce_in_chunks<A>(ds: &mut Downsampler<i16, A>, data: &[i16], split: usize) -> usize
where
    A: daq_scan::downsample::Accumulator + From<i16>,
{
    data.chunks(split.max(1)).map(|c| ds.reduce(c)).sum()
}

#[test]
fn constant_input_is_exact_for_every_split() {
    let (w, h, margin, osr) = (5, 3, 2, 4);
    let value = -1234i16;
    let n = (w + margin) * h * osr;
    let data = vec![value; n];

    for split in 1..=n {
        let mut avg =
            Downsampler::<i16, i32>::new(ReductionMode::Average, osr, [w, h], margin).unwrap();
        assert_eq!(reduce_in_chunks(&mut avg, &data, split), n, "split {split}");
        assert!(avg.is_complete());
        assert!(avg.image().iter().all(|&v| v == value as i32), "split {split}");

        let mut sum =
            Downsampler::<i16, i64>::new(ReductionMode::Sum, osr, [w, h], margin).unwrap();
        reduce_in_chunks(&mut sum, &data, split);
        assert!(sum.image().iter().all(|&v| v == value as i64 * osr as i64), "split {split}");
    }
}

#[test]
fn margin_positions_never_reach_the_image() {
    let (w, h, osr) = (6, 4, 2);
    for margin in 0..w {
        let line = w + margin;
        // Margin samples carry a sentinel, real pixels carry their column
        let data: Vec<i16> = (0..line * h * osr)
            .map(|i| {
                let col = (i / osr) % line;
                if col < margin {
                    i16::MIN
                } else {
                    (col - margin) as i16
                }
            })
            .collect();
        let mut ds =
            Downsampler::<i16, i32>::new(ReductionMode::Average, osr, [w, h], margin).unwrap();
        reduce_in_chunks(&mut ds, &data, 7);

        let expected = Array2::from_shape_fn((h, w), |(_, c)| c as i32);
        assert_eq!(ds.image(), &expected, "margin {margin}");
    }
}

#[test]
fn raster_with_margin_in_three_chunks() {
    let data: Vec<i16> = (0..18).collect();
    let mut ds = Downsampler::<i16, i32>::new(ReductionMode::Average, 1, [4, 3], 2).unwrap();
    for chunk in data.chunks(6) {
        ds.reduce(chunk);
    }
    let expected = ndarray::arr2(&[[2, 3, 4, 5], [8, 9, 10, 11], [14, 15, 16, 17]]);
    assert_eq!(ds.image(), &expected);
}

#[test]
fn average_and_sum_of_oversampled_pixels() {
    let data = [1i16, 1, 1, 2, 2, 2, 3, 3, 3];
    let mut avg = Downsampler::<i16, i32>::new(ReductionMode::Average, 3, [3, 1], 0).unwrap();
    avg.reduce(&data);
    assert_eq!(avg.image().as_slice().unwrap(), &[1, 2, 3]);

    let mut sum = Downsampler::<i16, i32>::new(ReductionMode::Sum, 3, [3, 1], 0).unwrap();
    sum.reduce(&data);
    assert_eq!(sum.image().as_slice().unwrap(), &[3, 6, 9]);
}

#[test]
fn frame_restarts_after_take() {
    let mut ds = Downsampler::<u32, u64>::new(ReductionMode::Sum, 2, [2, 2], 0).unwrap();
    let frame: Vec<u32> = vec![1; 8];
    assert_eq!(ds.reduce(&frame), 8);
    let first = ds.take_frame();
    assert!(first.iter().all(|&v| v == 2));
    assert_eq!(ds.cursor().next_sample_index, 0);
    assert!(ds.image().iter().all(|&v| v == 0));
}
