pub use self::rayon::rayon_run;

mod rayon;
