//! Climate-driven tile classification
//!
//! Tile rasters store one material id per texel. The id follows from the
//! height above sea level and two low-frequency climate fields.

use noise::{NoiseFn, Perlin};

/// Surface classes written to tile rasters
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Biome {
    Ocean = 0,
    Beach,
    Desert,
    Grassland,
    Forest,
    Taiga,
    Tundra,
    Mountains,
    Snow,
}

impl Biome {
    pub const ALL: [Biome; 9] = [
        Biome::Ocean,
        Biome::Beach,
        Biome::Desert,
        Biome::Grassland,
        Biome::Forest,
        Biome::Taiga,
        Biome::Tundra,
        Biome::Mountains,
        Biome::Snow,
    ];

    /// Material id stored in tile rasters
    pub fn tile_id(self) -> u8 {
        self as u8
    }

    pub fn from_tile_id(id: u8) -> Option<Self> {
        Self::ALL.get(id as usize).copied()
    }

    pub fn is_water(self) -> bool {
        self == Biome::Ocean
    }
}

/// Height bands above sea level, in world units
const BEACH_BAND: f32 = 1.0;
const MOUNTAIN_LINE: f32 = 60.0;
const SNOW_LINE: f32 = 80.0;

/// Temperature and moisture fields
pub struct ClimateMap {
    temperature: Perlin,
    moisture: Perlin,
    temperature_frequency: f64,
    moisture_frequency: f64,
}

impl ClimateMap {
    pub fn new(seed: u32) -> Self {
        Self {
            temperature: Perlin::new(seed),
            moisture: Perlin::new(seed.wrapping_add(1000)),
            temperature_frequency: 0.0008,
            moisture_frequency: 0.0012,
        }
    }

    /// -1 (cold) to 1 (hot), cooling away from z = 0
    pub fn temperature(&self, x: f64, z: f64) -> f32 {
        let f = self.temperature_frequency;
        let base = self.temperature.get([x * f, z * f]) as f32;
        let latitude = ((z * 0.0002).abs() as f32).min(1.0);
        base - latitude * 0.5
    }

    /// 0 (dry) to 1 (wet)
    pub fn moisture(&self, x: f64, z: f64) -> f32 {
        let f = self.moisture_frequency;
        (self.moisture.get([x * f, z * f]) as f32 + 1.0) * 0.5
    }

    pub fn classify(&self, x: f64, z: f64, height: f32, sea_level: f32) -> Biome {
        let altitude = height - sea_level;
        if altitude < -2.0 {
            return Biome::Ocean;
        }
        if altitude < BEACH_BAND {
            return Biome::Beach;
        }
        if altitude > SNOW_LINE {
            return Biome::Snow;
        }
        if altitude > MOUNTAIN_LINE {
            return Biome::Mountains;
        }

        let temperature = self.temperature(x, z);
        let moisture = self.moisture(x, z);
        if temperature < -0.3 {
            return if moisture > 0.5 { Biome::Taiga } else { Biome::Tundra };
        }
        match moisture {
            m if m > 0.6 => Biome::Forest,
            m if m > 0.3 => Biome::Grassland,
            _ => Biome::Desert,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_height_bands() {
        let climate = ClimateMap::new(7);
        assert_eq!(climate.classify(0.0, 0.0, 10.0, 32.0), Biome::Ocean);
        assert_eq!(climate.classify(0.0, 0.0, 32.5, 32.0), Biome::Beach);
        assert_eq!(climate.classify(0.0, 0.0, 32.0 + 70.0, 32.0), Biome::Mountains);
        assert_eq!(climate.classify(0.0, 0.0, 32.0 + 90.0, 32.0), Biome::Snow);
    }

    #[test]
    fn test_climate_ranges() {
        let climate = ClimateMap::new(7);
        for i in 0..50 {
            let x = i as f64 * 173.0;
            let z = i as f64 * -91.0;
            let t = climate.temperature(x, z);
            let m = climate.moisture(x, z);
            assert!((-1.5..=1.0).contains(&t), "temperature {} out of range", t);
            assert!((0.0..=1.0).contains(&m), "moisture {} out of range", m);

            let biome = climate.classify(x, z, 50.0, 32.0);
            assert!(!biome.is_water());
        }
    }

    #[test]
    fn test_tile_ids() {
        for biome in Biome::ALL {
            assert_eq!(Biome::from_tile_id(biome.tile_id()), Some(biome));
        }
        assert_eq!(Biome::from_tile_id(200), None);
    }
}
