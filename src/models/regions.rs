//! Reference geography and name pools for synthetic buildings and contacts.
//!
//! Coordinates are the district reference points buildings are scattered
//! around; keep them stable so regenerated data lands in the same places.

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct District {
    pub name: &'static str,
    pub lat: f64,
    pub long: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Governorate {
    pub name: &'static str,
    pub lat: f64,
    pub long: f64,
    pub districts: &'static [District],
}

const fn d(name: &'static str, lat: f64, long: f64) -> District {
    District { name, lat, long }
}

pub static GOVERNORATES: [Governorate; 6] = [
    Governorate {
        name: "Capital",
        lat: 29.334167,
        long: 47.981389,
        districts: &[
            d("Kuwait City", 29.334167, 47.981389),
            d("Sharq", 29.358333, 48.0),
            d("Mirqab", 29.366667, 47.966667),
            d("Dasma", 29.366667, 47.966667),
        ],
    },
    Governorate {
        name: "Hawalli",
        lat: 29.305556,
        long: 48.030833,
        districts: &[
            d("Hawalli", 29.305556, 48.030833),
            d("Salmiya", 29.333333, 48.083333),
            d("Bayyan", 29.316667, 48.033333),
            d("Mishref", 29.266667, 48.083333),
        ],
    },
    Governorate {
        name: "Farwaniya",
        lat: 29.2770,
        long: 47.9333,
        districts: &[
            d("Farwaniya", 29.2770, 47.9333),
            d("Ardiya", 29.316667, 47.933333),
            d("Jleeb", 29.266667, 47.966667),
            d("Khaitan", 29.283333, 47.966667),
        ],
    },
    Governorate {
        name: "Mubarak Al-Kabeer",
        lat: 29.225,
        long: 48.083,
        districts: &[
            d("Adan", 29.216667, 48.083333),
            d("Mubarak Al-Kabeer", 29.225, 48.083),
            d("Qurain", 29.266667, 48.083333),
            d("Sabah Al-Salem", 29.25, 48.083333),
        ],
    },
    Governorate {
        name: "Ahmadi",
        lat: 29.083056,
        long: 48.083056,
        districts: &[
            d("Ahmadi", 29.083056, 48.083056),
            d("Fahaheel", 29.083333, 48.133333),
            d("Mangaf", 29.1, 48.133333),
            d("Abu Halifa", 29.116667, 48.133333),
        ],
    },
    Governorate {
        name: "Jahra",
        lat: 29.336573,
        long: 47.675529,
        districts: &[
            d("Jahra", 29.336573, 47.675529),
            d("Taima", 29.316667, 47.7),
            d("Naeem", 29.3, 47.716667),
            d("Sulaibiya", 29.283333, 47.783333),
        ],
    },
];

pub const FIRST_NAMES: [&str; 16] = [
    "Ahmad", "Fatima", "Yousef", "Maryam", "Khaled", "Noura", "Abdullah", "Sara", "Hamad", "Dana", "Faisal",
    "Reem", "Omar", "Hessa", "Bader", "Lulwa",
];

pub const LAST_NAMES: [&str; 12] = [
    "Al-Sabah",
    "Al-Mutairi",
    "Al-Azmi",
    "Al-Enezi",
    "Al-Ajmi",
    "Al-Rashidi",
    "Al-Shammari",
    "Al-Kandari",
    "Al-Hajri",
    "Al-Otaibi",
    "Al-Fadhli",
    "Al-Dosari",
];

pub const STREETS: [&str; 12] = [
    "Gulf Road",
    "Fahad Al-Salem Street",
    "Abdullah Al-Mubarak Street",
    "Tunis Street",
    "Salem Al-Mubarak Street",
    "Damascus Street",
    "Baghdad Street",
    "Amman Street",
    "Cairo Street",
    "Jamal Abdul Nasser Street",
    "Istiqlal Street",
    "Arabian Gulf Street",
];

pub const EMAIL_DOMAINS: [&str; 4] = ["example.com", "example.net", "example.org", "mail.example.com"];

pub fn governorate(name: &str) -> Option<&'static Governorate> {
    GOVERNORATES.iter().find(|g| g.name == name)
}

pub fn district(governorate_name: &str, district_name: &str) -> Option<&'static District> {
    governorate(governorate_name)?
        .districts
        .iter()
        .find(|d| d.name == district_name)
}
