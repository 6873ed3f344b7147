mod chunker;
mod filelist;
