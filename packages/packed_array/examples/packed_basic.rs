//! Basic usage example for `packed_array`.
//!
//! This example allocates a sensor reading batch: a header describing the sensor followed by a
//! runtime-determined number of samples, all in one heap allocation.

use packed_array::{PackedIter, PackedLayout, allocate_bytes, allocate_count, count};

#[derive(Debug)]
#[repr(C)]
struct SensorHeader {
    sensor_id: u32,
    scale: f32,
}

#[allow(dead_code, reason = "fields are accessed through the packed pointer")]
#[repr(C)]
struct Readings {
    header: SensorHeader,
    samples: [f32; 1],
}

// SAFETY: Readings is repr(C), starts with a SensorHeader, ends in [f32; 1] and has no Drop
// implementation of its own.
unsafe impl PackedLayout for Readings {
    type Header = SensorHeader;
    type Element = f32;
}

// SAFETY: Items are the elements themselves.
unsafe impl PackedIter for Readings {
    type Item = f32;
}

fn main() {
    let mut readings = allocate_count::<Readings>(6).construct_with(
        Readings {
            header: SensorHeader {
                sensor_id: 42,
                scale: 0.5,
            },
            samples: [1.0],
        },
        |index| u16::try_from(index).map_or(f32::NAN, f32::from),
    );

    println!("Allocated {} samples", count(&readings));

    let scale = readings.header().map_or(1.0, |header| header.scale);
    for sample in &mut readings {
        *sample *= scale;
    }

    if let Some(header) = readings.header() {
        println!("Sensor {} scaled by {}:", header.sensor_id, header.scale);
    }

    for (index, sample) in readings.iter().enumerate() {
        println!("  sample {index}: {sample}");
    }

    // A byte budget that does not divide evenly rounds down to whole elements.
    let budget = allocate_bytes::<u16>(11).construct(7);
    println!(
        "A budget of 11 bytes holds {} u16 values: {:?}",
        budget.count(),
        budget.as_slice()
    );

    // Dropping the pointers releases each block with a single deallocation.
    drop(readings);
    drop(budget);

    println!("Example completed successfully!");
}
